//! Sort, cursor and scroll state layered over a [`ResultGrid`].
//!
//! The grid keeps rows in the order the backend returned them; sorting only
//! permutes a list of indices into it, so clearing a sort restores the natural
//! order exactly. Reloads try to keep the cursor on the same row content.

use std::cmp::Ordering;

use crate::results::{Cell, ResultGrid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortState {
    pub column: Option<usize>,
    pub ascending: bool,
}

impl Default for SortState {
    fn default() -> Self {
        Self {
            column: None,
            ascending: true,
        }
    }
}

impl SortState {
    /// Same column flips direction; a different column starts ascending.
    #[must_use]
    pub fn toggled(self, column: usize) -> Self {
        if self.column == Some(column) {
            Self {
                column: Some(column),
                ascending: !self.ascending,
            }
        } else {
            Self {
                column: Some(column),
                ascending: true,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionState {
    pub row: usize,
    pub column: usize,
    pub signature: Option<Vec<String>>,
}

/// How the cursor was placed after [`ResultViewState::replace_grid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restore {
    /// The previously selected row content was found again.
    Relocated,
    /// No match; the previous position was clamped into the new grid.
    Clamped,
}

#[derive(Debug, Clone)]
pub struct ResultViewState {
    grid: ResultGrid,
    order: Vec<usize>,
    sort: SortState,
    row: usize,
    column: usize,
    row_offset: usize,
    column_offset: usize,
    viewport_rows: usize,
    viewport_columns: usize,
}

impl Default for ResultViewState {
    fn default() -> Self {
        Self::new(ResultGrid::default())
    }
}

impl ResultViewState {
    #[must_use]
    pub fn new(grid: ResultGrid) -> Self {
        let order = (0..grid.row_count()).collect();
        Self {
            grid,
            order,
            sort: SortState::default(),
            row: 0,
            column: 0,
            row_offset: 0,
            column_offset: 0,
            viewport_rows: 1,
            viewport_columns: 1,
        }
    }

    #[must_use]
    pub fn grid(&self) -> &ResultGrid {
        &self.grid
    }

    #[must_use]
    pub fn sort(&self) -> SortState {
        self.sort
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.order.len()
    }

    /// Row at `index` in the current (possibly sorted) order.
    #[must_use]
    pub fn row(&self, index: usize) -> Option<&[Cell]> {
        self.order
            .get(index)
            .and_then(|source| self.grid.rows().get(*source))
            .map(Vec::as_slice)
    }

    pub fn rows(&self) -> impl Iterator<Item = &[Cell]> + '_ {
        self.order
            .iter()
            .filter_map(|source| self.grid.rows().get(*source).map(Vec::as_slice))
    }

    #[must_use]
    pub fn selection(&self) -> SelectionState {
        SelectionState {
            row: self.row,
            column: self.column,
            signature: self.selected_signature(),
        }
    }

    #[must_use]
    pub fn selected_row(&self) -> Option<&[Cell]> {
        self.row(self.row)
    }

    #[must_use]
    pub fn selected_cell(&self) -> Option<&Cell> {
        self.selected_row().and_then(|cells| cells.get(self.column))
    }

    #[must_use]
    pub fn selected_column_name(&self) -> Option<&str> {
        self.grid.columns().get(self.column).map(String::as_str)
    }

    #[must_use]
    pub fn selected_signature(&self) -> Option<Vec<String>> {
        self.order
            .get(self.row)
            .and_then(|source| self.grid.row_signature(*source))
    }

    #[must_use]
    pub fn offsets(&self) -> (usize, usize) {
        (self.row_offset, self.column_offset)
    }

    pub fn toggle_sort(&mut self, column: usize) {
        if column >= self.grid.column_count() {
            return;
        }
        self.set_sort(self.sort.toggled(column));
    }

    pub fn clear_sort(&mut self) {
        self.set_sort(SortState::default());
    }

    /// Applies a sort, keeping the cursor on the same row content.
    pub fn set_sort(&mut self, sort: SortState) {
        let signature = self.selected_signature();
        self.sort = sort;
        self.rebuild_order();
        if let Some(position) = signature.and_then(|signature| self.find_signature(&signature)) {
            self.row = position;
        }
        self.clamp_selection();
        self.ensure_visible();
    }

    /// `sort: none`, or `sort <column> asc|desc`.
    #[must_use]
    pub fn sort_status(&self) -> String {
        let Some(column) = self.sort.column else {
            return "sort: none".to_string();
        };
        let name = self
            .grid
            .columns()
            .get(column)
            .map_or_else(|| format!("col{}", column + 1), |name| name.to_lowercase());
        let direction = if self.sort.ascending { "asc" } else { "desc" };
        format!("sort {name} {direction}")
    }

    /// Swaps in a freshly loaded grid, re-sorting and relocating the cursor
    /// by row signature, or clamping it when the row is gone.
    pub fn replace_grid(&mut self, grid: ResultGrid) -> Restore {
        let signature = self.selected_signature();

        self.grid = grid;
        if self
            .sort
            .column
            .is_some_and(|column| column >= self.grid.column_count())
        {
            self.sort = SortState::default();
        }
        self.rebuild_order();

        let restore = match signature.and_then(|signature| self.find_signature(&signature)) {
            Some(position) => {
                self.row = position;
                Restore::Relocated
            }
            None => Restore::Clamped,
        };

        self.clamp_selection();
        self.row_offset = self.row_offset.min(self.row_count().saturating_sub(1));
        self.column_offset = self
            .column_offset
            .min(self.grid.column_count().saturating_sub(1));
        self.ensure_visible();
        restore
    }

    pub fn set_viewport(&mut self, rows: usize, columns: usize) {
        self.viewport_rows = rows.max(1);
        self.viewport_columns = columns.max(1);
        self.ensure_visible();
    }

    pub fn move_down(&mut self, steps: usize) {
        self.row = self.row.saturating_add(steps);
        self.clamp_selection();
        self.ensure_visible();
    }

    pub fn move_up(&mut self, steps: usize) {
        self.row = self.row.saturating_sub(steps);
        self.ensure_visible();
    }

    pub fn move_right(&mut self, steps: usize) {
        self.column = self.column.saturating_add(steps);
        self.clamp_selection();
        self.ensure_visible();
    }

    pub fn move_left(&mut self, steps: usize) {
        self.column = self.column.saturating_sub(steps);
        self.ensure_visible();
    }

    pub fn page_down(&mut self) {
        self.move_down(self.viewport_rows);
    }

    pub fn page_up(&mut self) {
        self.move_up(self.viewport_rows);
    }

    pub fn select_first_row(&mut self) {
        self.row = 0;
        self.ensure_visible();
    }

    pub fn select_last_row(&mut self) {
        self.row = self.row_count().saturating_sub(1);
        self.ensure_visible();
    }

    fn clamp_selection(&mut self) {
        self.row = self.row.min(self.row_count().saturating_sub(1));
        self.column = self.column.min(self.grid.column_count().saturating_sub(1));
    }

    fn ensure_visible(&mut self) {
        if self.row < self.row_offset {
            self.row_offset = self.row;
        } else if self.row >= self.row_offset + self.viewport_rows {
            self.row_offset = self.row + 1 - self.viewport_rows;
        }

        if self.column < self.column_offset {
            self.column_offset = self.column;
        } else if self.column >= self.column_offset + self.viewport_columns {
            self.column_offset = self.column + 1 - self.viewport_columns;
        }
    }

    fn find_signature(&self, signature: &[String]) -> Option<usize> {
        self.order.iter().position(|source| {
            self.grid.rows().get(*source).is_some_and(|cells| {
                cells.len() == signature.len()
                    && cells
                        .iter()
                        .zip(signature)
                        .all(|(cell, text)| cell.display() == text)
            })
        })
    }

    fn rebuild_order(&mut self) {
        let mut order: Vec<usize> = (0..self.grid.row_count()).collect();
        if let Some(column) = self.sort.column {
            let rows = self.grid.rows();
            let text = |index: usize| rows[index].get(column).map_or("", Cell::display);
            let ascending = self.sort.ascending;
            merge_sort_by(&mut order, &mut |left: &usize, right: &usize| {
                let ordering = compare_cell_text(text(*left), text(*right));
                if ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }
        self.order = order;
    }
}

/// Numeric when both sides parse as numbers, otherwise case-insensitive text.
#[must_use]
pub fn compare_cell_text(left: &str, right: &str) -> Ordering {
    if let (Ok(left), Ok(right)) = (left.trim().parse::<f64>(), right.trim().parse::<f64>()) {
        return left.partial_cmp(&right).unwrap_or(Ordering::Equal);
    }
    left.to_lowercase().cmp(&right.to_lowercase())
}

/// Stable top-down merge sort. The mixed numeric/text comparison is not a
/// total order, so this never relies on transitivity to terminate.
fn merge_sort_by<T: Copy>(items: &mut [T], compare: &mut dyn FnMut(&T, &T) -> Ordering) {
    if items.len() <= 1 {
        return;
    }
    let middle = items.len() / 2;
    merge_sort_by(&mut items[..middle], compare);
    merge_sort_by(&mut items[middle..], compare);

    let mut merged = Vec::with_capacity(items.len());
    let (mut left, mut right) = (0, middle);
    while left < middle && right < items.len() {
        if compare(&items[right], &items[left]) == Ordering::Less {
            merged.push(items[right]);
            right += 1;
        } else {
            merged.push(items[left]);
            left += 1;
        }
    }
    merged.extend_from_slice(&items[left..middle]);
    merged.extend_from_slice(&items[right..]);
    items.copy_from_slice(&merged);
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::{compare_cell_text, ResultViewState, Restore, SortState};
    use crate::query_runner::CellValue;
    use crate::results::ResultGrid;

    fn grid(columns: &[&str], rows: &[&[&str]]) -> ResultGrid {
        ResultGrid::from_values(
            columns.iter().map(ToString::to_string).collect(),
            rows.iter()
                .map(|row| {
                    row.iter()
                        .map(|value| CellValue::Text((*value).to_string()))
                        .collect()
                })
                .collect(),
        )
    }

    fn column_texts(view: &ResultViewState, column: usize) -> Vec<String> {
        view.rows()
            .map(|cells| cells[column].display().to_string())
            .collect()
    }

    fn five_rows() -> ResultGrid {
        grid(
            &["id", "name"],
            &[&["1", "a"], &["2", "b"], &["3", "c"], &["4", "d"], &["5", "e"]],
        )
    }

    #[test]
    fn toggling_the_same_column_flips_direction() {
        let sort = SortState::default().toggled(2);
        assert_eq!(sort, SortState { column: Some(2), ascending: true });
        let sort = sort.toggled(2);
        assert!(!sort.ascending);
        let sort = sort.toggled(0);
        assert_eq!(sort, SortState { column: Some(0), ascending: true });
    }

    #[test]
    fn mixed_values_sort_numbers_numerically() {
        let mut view = ResultViewState::new(grid(&["amount"], &[&["10"], &["9"], &["abc"]]));
        view.toggle_sort(0);

        let sorted = column_texts(&view, 0);
        let nine = sorted.iter().position(|v| v == "9").expect("9 present");
        let ten = sorted.iter().position(|v| v == "10").expect("10 present");
        assert!(nine < ten, "{sorted:?}");
        assert_eq!(compare_cell_text("abc", "10"), Ordering::Greater);
        assert_eq!(compare_cell_text(" 2.5 ", "10"), Ordering::Less);
        assert_eq!(compare_cell_text("Beta", "alpha"), Ordering::Greater);
    }

    #[test]
    fn descending_sort_and_clearing_restores_natural_order() {
        let mut view = ResultViewState::new(grid(&["n"], &[&["2"], &["10"], &["1"]]));
        view.toggle_sort(0);
        view.toggle_sort(0);
        assert_eq!(column_texts(&view, 0), ["10", "2", "1"]);
        assert_eq!(view.sort_status(), "sort n desc");

        view.clear_sort();
        assert_eq!(column_texts(&view, 0), ["2", "10", "1"]);
        assert_eq!(view.sort_status(), "sort: none");
    }

    #[test]
    fn sort_is_stable_for_equal_keys() {
        let mut view = ResultViewState::new(grid(
            &["k", "tag"],
            &[&["b", "1"], &["a", "2"], &["B", "3"], &["a", "4"]],
        ));
        view.toggle_sort(0);
        assert_eq!(column_texts(&view, 1), ["2", "4", "1", "3"]);
    }

    #[test]
    fn sorting_keeps_the_cursor_on_the_same_row() {
        let mut view = ResultViewState::new(grid(&["n"], &[&["3"], &["1"], &["2"]]));
        view.move_down(0);
        view.toggle_sort(0);
        assert_eq!(view.selection().row, 2);
        assert_eq!(
            view.selected_signature(),
            Some(vec!["3".to_string()])
        );
    }

    #[test]
    fn reload_relocates_selection_by_signature() {
        let mut view = ResultViewState::new(five_rows());
        view.move_down(2);
        let before = view.selected_signature();

        let shifted = grid(
            &["id", "name"],
            &[&["9", "z"], &["3", "c"], &["1", "a"], &["2", "b"], &["4", "d"], &["5", "e"]],
        );
        let restore = view.replace_grid(shifted);

        assert_eq!(restore, Restore::Relocated);
        assert_eq!(view.selection().row, 1);
        assert_eq!(view.selected_signature(), before);
    }

    #[test]
    fn reload_without_the_row_clamps_into_range() {
        let mut view = ResultViewState::new(five_rows());
        view.move_down(4);
        view.move_right(1);

        let restore = view.replace_grid(grid(&["id", "name"], &[&["7", "x"], &["8", "y"]]));
        assert_eq!(restore, Restore::Clamped);
        let selection = view.selection();
        assert_eq!(selection.row, 1);
        assert_eq!(selection.column, 1);
        assert!(selection.row < view.row_count());
    }

    #[test]
    fn reload_to_an_empty_grid_keeps_indices_at_zero() {
        let mut view = ResultViewState::new(five_rows());
        view.move_down(3);
        view.replace_grid(grid(&["id", "name"], &[]));
        assert_eq!(view.selection().row, 0);
        assert!(view.selected_cell().is_none());
        assert_eq!(view.offsets(), (0, 0));
    }

    #[test]
    fn reload_reapplies_sort_or_resets_it_when_the_column_vanished() {
        let mut view = ResultViewState::new(five_rows());
        view.toggle_sort(1);
        view.toggle_sort(1);

        view.replace_grid(grid(&["id", "name"], &[&["1", "a"], &["2", "q"]]));
        assert_eq!(column_texts(&view, 1), ["q", "a"]);

        view.replace_grid(grid(&["id"], &[&["1"], &["2"]]));
        assert_eq!(view.sort(), SortState::default());
    }

    #[test]
    fn movement_is_clamped_and_scroll_follows_the_cursor() {
        let mut view = ResultViewState::new(five_rows());
        view.set_viewport(2, 1);

        view.move_down(10);
        assert_eq!(view.selection().row, 4);
        assert_eq!(view.offsets().0, 3);

        view.move_up(4);
        assert_eq!(view.selection().row, 0);
        assert_eq!(view.offsets().0, 0);

        view.move_right(5);
        assert_eq!(view.selection().column, 1);
        assert_eq!(view.offsets().1, 1);
        assert_eq!(view.selected_column_name(), Some("name"));

        view.page_down();
        assert_eq!(view.selection().row, 2);
        view.select_last_row();
        assert_eq!(view.selected_cell().map(super::Cell::display), Some("e"));
        view.select_first_row();
        assert_eq!(view.offsets().0, 0);
    }

    #[test]
    fn out_of_range_sort_column_is_ignored() {
        let mut view = ResultViewState::new(five_rows());
        view.toggle_sort(7);
        assert_eq!(view.sort(), SortState::default());
    }
}

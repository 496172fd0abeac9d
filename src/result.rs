//! Text-format query results.

/// Result of a single statement, with every value in text format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
    command_tag: Option<String>,
}

impl QueryResult {
    pub(crate) fn set_columns(&mut self, columns: Vec<String>) {
        self.columns = columns;
    }

    pub(crate) fn push_row(&mut self, row: Vec<Option<String>>) {
        self.rows.push(row);
    }

    pub(crate) fn set_command_tag(&mut self, tag: &str) {
        self.command_tag = Some(tag.to_string());
    }

    /// Column names, empty for statements that return no rows.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// All rows. `None` is SQL NULL.
    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }

    /// Consume the result and return its rows.
    pub fn into_rows(self) -> Vec<Vec<Option<String>>> {
        self.rows
    }

    /// Value at `row`, `column`. `None` if out of range or NULL.
    pub fn get(&self, row: usize, column: usize) -> Option<&str> {
        self.rows.get(row)?.get(column)?.as_deref()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Command tag such as `INSERT 0 1`, absent for an empty query.
    pub fn command_tag(&self) -> Option<&str> {
        self.command_tag.as_deref()
    }

    /// Rows affected, parsed from the trailing number of the command tag.
    pub fn rows_affected(&self) -> Option<u64> {
        self.command_tag
            .as_deref()?
            .rsplit(' ')
            .next()
            .and_then(|n| n.parse().ok())
    }
}

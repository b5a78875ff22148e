/// Redis key layout for a changelog table.
#[derive(Debug, Clone)]
pub struct ChangelogKeys<'a> {
    pub prefix: &'a str,
    pub table: &'a str,
}

impl<'a> ChangelogKeys<'a> {
    pub fn new(prefix: &'a str, table: &'a str) -> Self {
        Self { prefix, table }
    }

    /// Hash holding the table descriptor (partition key name, creation time).
    pub fn table_meta(&self) -> String {
        format!("{}:{}:meta", self.prefix, self.table)
    }

    pub fn item(&self, key: &str) -> String {
        format!("{}:{}:item:{}", self.prefix, self.table, key)
    }

    /// Glob pattern matching every key of the table.
    pub fn pattern(&self) -> String {
        format!("{}:{}:*", self.prefix, self.table)
    }
}

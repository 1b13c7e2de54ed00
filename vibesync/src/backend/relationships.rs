//! Directed relationship graph between replicated tables.
//!
//! Consulted by the ingestor for observational metadata only;
//! dispatch never depends on it. Cascade deletes show up in the
//! WAL as plain per-row deletes, and this map names the tables a
//! delete is expected to ripple into.

use std::collections::HashMap;

/// `parent -> children` edges, canonical plural names.
pub struct Relationships {
    children: HashMap<&'static str, Vec<&'static str>>,
}

impl Default for Relationships {
    fn default() -> Self {
        let mut children = HashMap::new();
        children.insert("projects", vec!["tasks"]);
        children.insert("tasks", vec!["comments"]);
        children.insert("users", vec!["projects", "comments"]);

        Self { children }
    }
}

impl Relationships {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tables a delete on `table` can cascade into.
    pub fn cascades_into(&self, table: &str) -> &[&'static str] {
        self.children
            .get(table)
            .map(|children| children.as_slice())
            .unwrap_or(&[])
    }

    /// Transitive closure, for logging the full blast radius.
    pub fn all_descendants(&self, table: &str) -> Vec<&'static str> {
        let mut seen = vec![];
        let mut queue: Vec<&str> = self.cascades_into(table).to_vec();

        while let Some(next) = queue.pop() {
            if seen.contains(&next) {
                continue;
            }
            seen.push(next);
            queue.extend(self.cascades_into(next));
        }

        seen.sort();
        seen
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_direct_children() {
        let relationships = Relationships::new();
        assert_eq!(relationships.cascades_into("projects"), &["tasks"]);
        assert_eq!(relationships.cascades_into("comments"), &[] as &[&str]);
    }

    #[test]
    fn test_descendants() {
        let relationships = Relationships::new();
        assert_eq!(
            relationships.all_descendants("projects"),
            vec!["comments", "tasks"]
        );
        assert_eq!(
            relationships.all_descendants("users"),
            vec!["comments", "projects", "tasks"]
        );
    }
}

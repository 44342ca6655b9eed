//! Dataset Registry (§4.4): process-wide mapping from dataset name to
//! [`Dataset`]. Owned by the server reactor and mutated only from that
//! thread, so no external locking is required.

use std::collections::HashMap;

use crate::dataset::Dataset;

#[derive(Default)]
pub struct Registry {
    datasets: HashMap<String, Dataset>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the named dataset, creating it (empty) if this is the first
    /// reference to it.
    pub fn get_or_create(&mut self, name: &str) -> &mut Dataset {
        self.datasets.entry(name.to_string()).or_default()
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Dataset> {
        self.datasets.get_mut(name)
    }

    /// Dataset names currently known to the registry, for the info response
    /// (§4.2).
    pub fn list_names(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    /// Owned snapshot of dataset names, for callers that need to iterate
    /// while independently looking up (and mutating) each dataset by name.
    pub fn dataset_names_snapshot(&self) -> Vec<String> {
        self.datasets.keys().cloned().collect()
    }

    pub fn all_datasets_mut(&mut self) -> impl Iterator<Item = &mut Dataset> {
        self.datasets.values_mut()
    }

    /// Drops datasets with neither a source nor any sinks. The spec allows
    /// (but does not require) this; keeping it bounds memory for long-lived
    /// servers that see many short-lived, uniquely-named datasets.
    pub fn garbage_collect(&mut self) {
        self.datasets.retain(|_, ds| !ds.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_idempotent_by_name() {
        let mut reg = Registry::new();
        reg.get_or_create("alpha").sinks.insert(
            mio::Token(1),
            crate::dataset::SinkSlot::new(
                mio::Token(1),
                "127.0.0.1:1".parse().unwrap(),
                crate::proto::DataMode::Default,
            ),
        );
        assert_eq!(reg.get_or_create("alpha").sinks.len(), 1);
        assert_eq!(reg.list_names().collect::<Vec<_>>(), vec!["alpha"]);
    }

    #[test]
    fn garbage_collect_drops_empty_datasets_only() {
        let mut reg = Registry::new();
        reg.get_or_create("empty");
        reg.get_or_create("populated").sinks.insert(
            mio::Token(1),
            crate::dataset::SinkSlot::new(
                mio::Token(1),
                "127.0.0.1:1".parse().unwrap(),
                crate::proto::DataMode::Default,
            ),
        );
        reg.garbage_collect();
        let names: Vec<_> = reg.list_names().collect();
        assert_eq!(names, vec!["populated"]);
    }
}

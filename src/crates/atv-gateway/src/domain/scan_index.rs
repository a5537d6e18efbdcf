//! The scan index: label → discovered target, rebuilt on every `scan`.

use std::collections::HashMap;

use atv_core::DeviceTarget;

/// Targets from the most recent discovery, keyed by `"name (address)"`.
///
/// Labels are kept in discovery order for the `scanResult` reply.  When two
/// targets share a label the later one wins and the label is listed once.
#[derive(Debug, Clone, Default)]
pub struct ScanIndex {
    labels: Vec<String>,
    targets: HashMap<String, DeviceTarget>,
}

impl ScanIndex {
    /// Builds an index from discovery output.
    ///
    /// With `tv_only` set, targets whose model lacks the TV marker are
    /// dropped before indexing.
    pub fn build(targets: impl IntoIterator<Item = DeviceTarget>, tv_only: bool) -> Self {
        let mut index = Self::default();
        for target in targets {
            if tv_only && !target.is_tv() {
                continue;
            }
            let label = target.label();
            if index.targets.insert(label.clone(), target).is_none() {
                index.labels.push(label);
            }
        }
        index
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn get(&self, label: &str) -> Option<&DeviceTarget> {
        self.targets.get(label)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str, addr: &str, id: &str, model: &str) -> DeviceTarget {
        DeviceTarget::new(name, addr.parse().unwrap(), id, model)
    }

    #[test]
    fn test_build_filters_non_tv_models() {
        // Arrange
        let found = vec![
            target("Living Room", "10.0.0.5", "a", "Apple TV 4K"),
            target("Kitchen", "10.0.0.9", "b", "HomePod"),
        ];

        // Act
        let index = ScanIndex::build(found, true);

        // Assert
        assert_eq!(index.labels(), &["Living Room (10.0.0.5)".to_string()]);
        assert!(index.get("Kitchen (10.0.0.9)").is_none());
    }

    #[test]
    fn test_build_without_filter_keeps_everything() {
        let found = vec![
            target("Living Room", "10.0.0.5", "a", "Apple TV 4K"),
            target("Kitchen", "10.0.0.9", "b", "HomePod"),
        ];
        let index = ScanIndex::build(found, false);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_duplicate_label_overwrites_and_is_listed_once() {
        let found = vec![
            target("Den", "10.0.0.7", "first", "Apple TV"),
            target("Den", "10.0.0.7", "second", "Apple TV"),
        ];

        let index = ScanIndex::build(found, true);

        assert_eq!(index.len(), 1);
        assert_eq!(index.get("Den (10.0.0.7)").unwrap().identifier(), "second");
    }

    #[test]
    fn test_default_index_is_empty() {
        let index = ScanIndex::default();
        assert!(index.is_empty());
        assert!(index.get("anything").is_none());
    }
}

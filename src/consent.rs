//! Consent filtering by event category

use crate::event::ConsentCategory;
use serde::{Deserialize, Serialize};

/// Which consent categories are currently blocked from collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentConfig {
    pub necessary: bool,
    pub performance: bool,
    pub targeting: bool,
}

impl ConsentConfig {
    pub fn is_blocked(&self, category: ConsentCategory) -> bool {
        match category {
            ConsentCategory::Necessary => self.necessary,
            ConsentCategory::Performance => self.performance,
            ConsentCategory::Targeting => self.targeting,
        }
    }

    pub fn set_blocked(&mut self, category: ConsentCategory, blocked: bool) {
        match category {
            ConsentCategory::Necessary => self.necessary = blocked,
            ConsentCategory::Performance => self.performance = blocked,
            ConsentCategory::Targeting => self.targeting = blocked,
        }
    }

    /// Build from a comma separated list of blocked category names.
    /// Unknown names are skipped.
    pub fn from_blocked_list(list: &str) -> Self {
        let mut config = Self::default();
        for category in list.split(',').filter_map(ConsentCategory::parse) {
            config.set_blocked(category, true);
        }
        config
    }

    pub fn blocked_categories(&self) -> Vec<ConsentCategory> {
        ConsentCategory::ALL
            .into_iter()
            .filter(|c| self.is_blocked(*c))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nothing_blocked_by_default() {
        let config = ConsentConfig::default();
        for category in ConsentCategory::ALL {
            assert!(!config.is_blocked(category));
        }
    }

    #[test]
    fn test_set_blocked_toggles_single_category() {
        let mut config = ConsentConfig::default();
        config.set_blocked(ConsentCategory::Targeting, true);

        assert!(config.is_blocked(ConsentCategory::Targeting));
        assert!(!config.is_blocked(ConsentCategory::Performance));

        config.set_blocked(ConsentCategory::Targeting, false);
        assert!(!config.is_blocked(ConsentCategory::Targeting));
    }

    #[test]
    fn test_from_blocked_list() {
        let config = ConsentConfig::from_blocked_list("targeting, PERFORMANCE,bogus");
        assert_eq!(
            config.blocked_categories(),
            vec![ConsentCategory::Performance, ConsentCategory::Targeting]
        );
    }
}

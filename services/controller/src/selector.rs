//! Pod selectors derived from a deployment's pod-template selector.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::{ParseExpressionError, Selector, SelectorExt};

/// A deployment's pod selector.
///
/// An empty label selector matches every pod; [`PodSelector::nothing`]
/// stands in for a deployment without a spec and matches none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSelector(Option<Selector>);

impl PodSelector {
    pub fn nothing() -> Self {
        Self(None)
    }

    pub fn from_label_selector(selector: &LabelSelector) -> Result<Self, ParseExpressionError> {
        Selector::try_from(selector.clone()).map(|s| Self(Some(s)))
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.as_ref().is_some_and(|s| s.matches(labels))
    }

    pub fn selects_all(&self) -> bool {
        self.0.as_ref().is_some_and(Selector::selects_all)
    }
}

impl fmt::Display for PodSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(selector) => fmt::Display::fmt(selector, f),
            None => f.write_str("<none>"),
        }
    }
}

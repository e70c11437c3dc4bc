//! What to click, and how to find it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One way of locating a control on the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum SelectorStrategy {
    /// A CSS selector.
    Css(String),
    /// A button whose `aria-label` contains this text.
    AriaLabel(String),
    /// A button whose visible text contains this text.
    Text(String),
}

impl fmt::Display for SelectorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorStrategy::Css(s) => write!(f, "css:{}", s),
            SelectorStrategy::AriaLabel(s) => write!(f, "aria-label:{}", s),
            SelectorStrategy::Text(s) => write!(f, "text:{}", s),
        }
    }
}

/// A control to activate, with strategies tried in order until one matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTarget {
    pub name: String,
    pub strategies: Vec<SelectorStrategy>,
}

impl ActionTarget {
    pub fn new(name: impl Into<String>, strategies: Vec<SelectorStrategy>) -> Self {
        Self {
            name: name.into(),
            strategies,
        }
    }
}

/// The controls one action touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPlan {
    pub control: ActionTarget,
    /// Follow-up control, activated only if it shows up.
    pub confirm: Option<ActionTarget>,
}

impl ActionPlan {
    /// Instant repost: open the repost menu, then pick the plain repost entry.
    ///
    /// Strategies go from most to least specific so small markup or label
    /// changes fall through to a looser match instead of failing.
    pub fn repost() -> Self {
        Self {
            control: ActionTarget::new(
                "repost",
                vec![
                    SelectorStrategy::Css("button.social-reshare-button".to_string()),
                    SelectorStrategy::AriaLabel("Repost".to_string()),
                    SelectorStrategy::Text("Repost".to_string()),
                ],
            ),
            confirm: Some(ActionTarget::new(
                "repost confirmation",
                vec![
                    SelectorStrategy::Css(
                        ".social-reshare-menu button[data-control-name='instant_repost']"
                            .to_string(),
                    ),
                    SelectorStrategy::AriaLabel("Repost instantly".to_string()),
                    SelectorStrategy::Text("Repost instantly".to_string()),
                ],
            )),
        }
    }

    /// Drop confirm strategies that would also match the main control.
    ///
    /// Clicking the main control a second time closes the menu it opened.
    /// A confirm target left with no strategies is removed.
    pub fn without_confirm_overlap(mut self) -> Self {
        if let Some(confirm) = self.confirm.as_mut() {
            let control = &self.control.strategies;
            confirm.strategies.retain(|s| !control.contains(s));
        }
        self.confirm = self.confirm.filter(|c| !c.strategies.is_empty());
        self
    }
}

impl Default for ActionPlan {
    fn default() -> Self {
        Self::repost()
    }
}

//! Policy table — deterministic keyword and threshold rules that drive
//! classification, priority, and the approval requirement.
//!
//! Runs on every item, so everything is compiled regex against the
//! payload text. Order matters: P1 rules are checked before P2 rules,
//! so P1 wins when both match.

use regex::Regex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::item::{Channel, Priority};

/// Which payload field a rule matches against.
#[derive(Debug, Clone)]
pub enum RuleField {
    Sender,
    Subject,
    Body,
    /// Subject + body concatenated.
    Text,
}

/// A single priority-escalation rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct PriorityRule {
    /// Human-readable pattern description.
    pub pattern: String,
    /// Compiled regex for matching.
    pub regex: Regex,
    /// Which payload field to match.
    pub field: RuleField,
    /// Priority this rule escalates to.
    pub priority: Priority,
}

/// A rule that forces `requires_approval = true`.
#[derive(Debug, Clone)]
pub struct ApprovalRule {
    /// Compiled regex for matching.
    pub regex: Regex,
    /// Which payload field to match.
    pub field: RuleField,
    /// Why this rule triggers.
    pub reason: String,
}

/// Deterministic rule table for the decision engine.
pub struct PolicyTable {
    priority_rules: Vec<PriorityRule>,
    approval_rules: Vec<ApprovalRule>,
    /// Currency amounts at or above this always require approval.
    amount_threshold: Decimal,
    amount_regex: Regex,
}

impl PolicyTable {
    /// Create a policy table with the default rule sets.
    pub fn default_rules() -> Self {
        let priority_rules = vec![
            // P1: money going wrong or hard deadlines
            PriorityRule {
                pattern: "payment failure".into(),
                regex: Regex::new(r"(?i)(payment (failed|declined|overdue)|chargeback|refund request)").unwrap(),
                field: RuleField::Text,
                priority: Priority::P1,
            },
            PriorityRule {
                pattern: "urgent/asap".into(),
                regex: Regex::new(r"(?i)\b(urgent|asap|immediately|emergency)\b").unwrap(),
                field: RuleField::Text,
                priority: Priority::P1,
            },
            PriorityRule {
                pattern: "outage/broken".into(),
                regex: Regex::new(r"(?i)(site (is )?down|not working|broken|outage|can'?t log ?in)").unwrap(),
                field: RuleField::Text,
                priority: Priority::P1,
            },
            // P2: commercial interest, complaints, deadlines further out
            PriorityRule {
                pattern: "sales inquiry".into(),
                regex: Regex::new(r"(?i)(quote|pricing|interested in|proposal|partnership)").unwrap(),
                field: RuleField::Text,
                priority: Priority::P2,
            },
            PriorityRule {
                pattern: "complaint".into(),
                regex: Regex::new(r"(?i)(complaint|disappointed|unacceptable|escalate)").unwrap(),
                field: RuleField::Text,
                priority: Priority::P2,
            },
            PriorityRule {
                pattern: "invoice/deadline".into(),
                regex: Regex::new(r"(?i)(invoice|due (date|by)|deadline|overdue)").unwrap(),
                field: RuleField::Text,
                priority: Priority::P2,
            },
        ];

        let approval_rules = vec![
            // Monetary language beyond a bare amount
            ApprovalRule {
                regex: Regex::new(r"(?i)(payment|invoice|refund|wire|transfer|purchase|bank account)").unwrap(),
                field: RuleField::Text,
                reason: "monetary signal".into(),
            },
            // Anything that implies communicating outward on the user's behalf
            ApprovalRule {
                regex: Regex::new(r"(?i)(please (reply|respond|confirm)|send (me|us|them)|post this|publish|announce)").unwrap(),
                field: RuleField::Text,
                reason: "external communication".into(),
            },
        ];

        Self {
            priority_rules,
            approval_rules,
            amount_threshold: dec!(100),
            amount_regex: Regex::new(r"[$€£]\s?(\d[\d,]*(?:\.\d+)?)").unwrap(),
        }
    }

    /// Create an empty policy table (for testing).
    pub fn empty() -> Self {
        Self {
            priority_rules: Vec::new(),
            approval_rules: Vec::new(),
            amount_threshold: dec!(100),
            amount_regex: Regex::new(r"[$€£]\s?(\d[\d,]*(?:\.\d+)?)").unwrap(),
        }
    }

    /// Override the monetary approval threshold.
    pub fn with_amount_threshold(mut self, threshold: Decimal) -> Self {
        self.amount_threshold = threshold;
        self
    }

    /// Add a custom priority rule.
    pub fn add_priority_rule(
        &mut self,
        pattern: &str,
        field: RuleField,
        priority: Priority,
    ) -> Result<(), regex::Error> {
        self.priority_rules.push(PriorityRule {
            pattern: pattern.into(),
            regex: Regex::new(pattern)?,
            field,
            priority,
        });
        Ok(())
    }

    /// Add a custom approval rule.
    pub fn add_approval_rule(
        &mut self,
        pattern: &str,
        field: RuleField,
        reason: &str,
    ) -> Result<(), regex::Error> {
        self.approval_rules.push(ApprovalRule {
            regex: Regex::new(pattern)?,
            field,
            reason: reason.into(),
        });
        Ok(())
    }

    fn field_value<'a>(
        field: &RuleField,
        sender: Option<&'a str>,
        subject: Option<&'a str>,
        text: &'a str,
    ) -> Option<&'a str> {
        match field {
            RuleField::Sender => sender,
            RuleField::Subject => subject,
            RuleField::Body | RuleField::Text => Some(text),
        }
    }

    /// Evaluate priority for a payload. Defaults to P3; P1 rules are
    /// checked before P2, so P1 takes precedence on conflict.
    pub fn priority_for(
        &self,
        sender: Option<&str>,
        subject: Option<&str>,
        text: &str,
    ) -> Priority {
        for wanted in [Priority::P1, Priority::P2] {
            for rule in self.priority_rules.iter().filter(|r| r.priority == wanted) {
                let Some(value) = Self::field_value(&rule.field, sender, subject, text) else {
                    continue;
                };
                if rule.regex.is_match(value) {
                    debug!(pattern = %rule.pattern, priority = %wanted, "Priority rule matched");
                    return wanted;
                }
            }
        }
        Priority::P3
    }

    /// Whether the payload forces `requires_approval = true`. Returns the
    /// matched reason.
    pub fn approval_reason(
        &self,
        sender: Option<&str>,
        subject: Option<&str>,
        text: &str,
    ) -> Option<String> {
        for rule in &self.approval_rules {
            let Some(value) = Self::field_value(&rule.field, sender, subject, text) else {
                continue;
            };
            if rule.regex.is_match(value) {
                return Some(rule.reason.clone());
            }
        }

        // Any amount at or above the threshold is a monetary signal even
        // without monetary keywords.
        if let Some(amount) = self.max_amount(text)
            && amount >= self.amount_threshold
        {
            return Some(format!("amount {amount} at or above threshold"));
        }

        None
    }

    /// Largest currency amount found in the text, if any.
    pub fn max_amount(&self, text: &str) -> Option<Decimal> {
        self.amount_regex
            .captures_iter(text)
            .filter_map(|c| c.get(1))
            .filter_map(|m| m.as_str().replace(',', "").parse::<Decimal>().ok())
            .max()
    }

    /// Classification tag for a channel. Content the policy cannot place
    /// is the engine's concern; the channel mapping itself is fixed.
    pub fn classification_for(&self, channel: Channel) -> &'static str {
        match channel {
            Channel::Mail => "email",
            Channel::SocialMention | Channel::SocialDm => "social",
            Channel::ErpRequest => "erp",
            Channel::LocalDrop => "file",
        }
    }
}

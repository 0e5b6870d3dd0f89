use std::collections::HashSet;

use async_trait::async_trait;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::store::RuleStore;

use super::expander::check_rule;
use super::{now_ms, Engine, EngineError};

#[async_trait]
impl RuleStore for Engine {
    async fn insert_rules(
        &self,
        subject: &str,
        rules: Vec<AvailabilityRule>,
        unique_per_day: bool,
    ) -> Result<Vec<AvailabilityRule>, EngineError> {
        if rules.is_empty() {
            return Ok(rules);
        }
        for rule in &rules {
            if rule.subject_id != subject {
                return Err(EngineError::InvalidRequest(format!(
                    "rule {} belongs to subject {:?}, not {subject:?}",
                    rule.id, rule.subject_id
                )));
            }
            check_rule(rule)?;
        }

        let mut txn = self.begin(subject).await;
        let existing = &txn.state().rules;
        if existing.len() + rules.len() > MAX_RULES_PER_SUBJECT {
            return Err(EngineError::LimitExceeded("too many rules for subject"));
        }
        if unique_per_day {
            let mut taken: HashSet<u8> = existing.iter().map(|r| r.day_of_week).collect();
            for rule in &rules {
                if !taken.insert(rule.day_of_week) {
                    return Err(EngineError::AlreadyExists(rule.day_of_week));
                }
            }
        }

        let event = Event::RulesAdded {
            subject_id: subject.to_string(),
            rules: rules.clone(),
        };
        txn.commit(&event).await?;
        tracing::debug!("subject {subject}: {} availability rules added", rules.len());
        Ok(rules)
    }

    async fn list_rules(&self, subject: &str) -> Result<Vec<AvailabilityRule>, EngineError> {
        let Some(st) = self.get_subject(subject) else {
            return Ok(Vec::new());
        };
        let guard = st.read().await;
        Ok(guard.rules.clone())
    }

    async fn update_rule(
        &self,
        subject: &str,
        rule_id: Ulid,
        patch: &RulePatch,
        unique_per_day: bool,
    ) -> Result<AvailabilityRule, EngineError> {
        if self.get_subject(subject).is_none() {
            return Err(EngineError::NotFound(rule_id));
        }
        let mut txn = self.begin(subject).await;
        let mut updated = txn
            .state()
            .rules
            .iter()
            .find(|r| r.id == rule_id)
            .cloned()
            .ok_or(EngineError::NotFound(rule_id))?;
        patch.apply(&mut updated, now_ms());
        check_rule(&updated)?;
        if unique_per_day
            && txn
                .state()
                .rules
                .iter()
                .any(|r| r.id != rule_id && r.day_of_week == updated.day_of_week)
        {
            return Err(EngineError::AlreadyExists(updated.day_of_week));
        }

        txn.commit(&Event::RuleUpdated {
            rule: updated.clone(),
        })
        .await?;
        Ok(updated)
    }
}

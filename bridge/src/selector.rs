//! Sticky primary election.
//!
//! The bridge accepts variable updates from exactly one Instance at a time.
//! Election is sticky: a primary that remains healthy is never displaced by
//! another claimant, because Instances transiently disagree about who is
//! primary while the cluster itself fails over, and following every claim
//! would flap. Tie-breaks always use the Manager-supplied ordering; the
//! selector never invents one.

use adit_types::InstanceRecord;

/// Election result. `NeverComputed` (the state before the first run) is
/// distinct from `None` (a run concluded that nothing is eligible), so the
/// first conclusion of any kind is observable as a transition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Election {
    #[default]
    NeverComputed,
    None,
    Primary(String),
}

#[derive(Debug, Default)]
pub struct PrimarySelector {
    current: Election,
}

impl PrimarySelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current effective primary id, if any.
    pub fn effective(&self) -> Option<&str> {
        match &self.current {
            Election::Primary(id) => Some(id),
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        self.current = Election::NeverComputed;
    }

    /// Run one election over the registry snapshot (Manager order). Returns
    /// true when the effective primary changed.
    pub fn evaluate(&mut self, records: &[&InstanceRecord]) -> bool {
        let next = self.select(records);
        if next == self.current {
            return false;
        }
        match &next {
            Election::Primary(id) => {
                let name = records
                    .iter()
                    .find(|r| r.id == *id)
                    .map(|r| r.name.as_str())
                    .unwrap_or("?");
                tracing::info!(instance = %name, %id, "effective primary changed");
            }
            Election::None => {
                let summary: Vec<String> = records
                    .iter()
                    .map(|r| {
                        format!(
                            "'{}' ({}): {}, reported primary {:?}, last status {:?}, {} poll failures",
                            r.name,
                            r.id,
                            r.conn_state,
                            r.reported_primary,
                            r.last_status_code,
                            r.status_poll_failures,
                        )
                    })
                    .collect();
                tracing::error!(
                    instances = %summary.join("; "),
                    "no healthy instances; no primary can be elected",
                );
            }
            Election::NeverComputed => {}
        }
        self.current = next;
        true
    }

    fn select(&self, records: &[&InstanceRecord]) -> Election {
        let claimants: Vec<&&InstanceRecord> = records
            .iter()
            .filter(|r| r.healthy() && r.reported_primary == Some(true))
            .collect();
        if claimants.len() > 1 {
            let list: Vec<String> = claimants
                .iter()
                .map(|r| format!("'{}' ({})", r.name, r.id))
                .collect();
            tracing::error!(
                instances = %list.join(", "),
                "split brain: multiple instances report primary",
            );
        }

        // Sticky: a healthy previous primary is kept while it still claims
        // the role, or while nobody else does.
        if let Election::Primary(prev) = &self.current {
            if let Some(record) = records.iter().find(|r| r.id == *prev) {
                if record.healthy()
                    && (record.reported_primary == Some(true) || claimants.is_empty())
                {
                    return self.current.clone();
                }
            }
        }

        if let Some(claimed) = claimants.first() {
            return Election::Primary(claimed.id.clone());
        }

        if let Some(fallback) = records.iter().find(|r| r.healthy()) {
            tracing::warn!(
                "No instance reporting primary. Falling back to '{}' ({})",
                fallback.name,
                fallback.id,
            );
            return Election::Primary(fallback.id.clone());
        }

        Election::None
    }
}

#[cfg(test)]
mod test {
    use adit_types::{ConnState, InstanceDescriptor};

    use super::*;

    fn record(id: &str, healthy: bool, reported_primary: Option<bool>) -> InstanceRecord {
        let mut record = InstanceRecord::new(&InstanceDescriptor {
            id: id.into(),
            name: format!("name-{id}"),
            description: String::new(),
            ip_address: "10.0.0.2".into(),
            api_port: 8001,
            control_port: 9091,
        });
        record.conn_state = if healthy {
            ConnState::Connected
        } else {
            ConnState::Disconnected
        };
        record.reported_primary = reported_primary;
        record
    }

    fn run(selector: &mut PrimarySelector, records: &[InstanceRecord]) -> bool {
        let refs: Vec<&InstanceRecord> = records.iter().collect();
        selector.evaluate(&refs)
    }

    #[test]
    fn elects_first_claimant_in_manager_order() {
        let mut selector = PrimarySelector::new();
        let records = [
            record("i1", true, Some(false)),
            record("i2", true, Some(true)),
        ];
        assert!(run(&mut selector, &records));
        assert_eq!(selector.effective(), Some("i2"));
    }

    #[test]
    fn split_brain_selects_by_manager_order_and_sticks() {
        let mut selector = PrimarySelector::new();
        let records = [record("i1", true, Some(true)), record("i2", true, Some(true))];
        assert!(run(&mut selector, &records));
        assert_eq!(selector.effective(), Some("i1"));

        // Repeated runs keep the choice (and keep flagging the condition).
        assert!(!run(&mut selector, &records));
        assert_eq!(selector.effective(), Some("i1"));
    }

    #[test]
    fn sticky_while_claiming_even_if_a_later_claimant_appears() {
        let mut selector = PrimarySelector::new();
        assert!(run(&mut selector, &[record("i2", true, Some(true))]));
        assert_eq!(selector.effective(), Some("i2"));

        // i1 now also claims primary and sorts first; the sitting primary
        // is still healthy and claiming, so nothing changes.
        let records = [record("i1", true, Some(true)), record("i2", true, Some(true))];
        assert!(!run(&mut selector, &records));
        assert_eq!(selector.effective(), Some("i2"));
    }

    #[test]
    fn sticky_when_uncontested_despite_dropped_claim() {
        let mut selector = PrimarySelector::new();
        assert!(run(&mut selector, &[record("i2", true, Some(true))]));

        // The primary transiently stops claiming but nobody else claims.
        let records = [
            record("i1", true, Some(false)),
            record("i2", true, Some(false)),
        ];
        assert!(!run(&mut selector, &records));
        assert_eq!(selector.effective(), Some("i2"));

        // Once another Instance claims, the non-claiming sitter is deposed.
        let records = [
            record("i1", true, Some(true)),
            record("i2", true, Some(false)),
        ];
        assert!(run(&mut selector, &records));
        assert_eq!(selector.effective(), Some("i1"));
    }

    #[test]
    fn falls_back_to_first_healthy_when_nobody_claims() {
        let mut selector = PrimarySelector::new();
        let records = [
            record("i1", false, Some(true)),
            record("i2", true, Some(false)),
        ];
        assert!(run(&mut selector, &records));
        assert_eq!(selector.effective(), Some("i2"));
    }

    #[test]
    fn unhealthy_primary_is_replaced() {
        let mut selector = PrimarySelector::new();
        let records = [record("i1", true, Some(true)), record("i2", true, Some(false))];
        run(&mut selector, &records);
        assert_eq!(selector.effective(), Some("i1"));

        // i1's transport drops; i2 is healthy but does not claim primary.
        let records = [
            record("i1", false, Some(true)),
            record("i2", true, Some(false)),
        ];
        assert!(run(&mut selector, &records));
        assert_eq!(selector.effective(), Some("i2"));
    }

    #[test]
    fn no_healthy_instances_elects_none() {
        let mut selector = PrimarySelector::new();
        run(&mut selector, &[record("i1", true, Some(true))]);

        let records = [record("i1", false, None)];
        assert!(run(&mut selector, &records));
        assert_eq!(selector.effective(), None);

        // None → None is not a transition.
        assert!(!run(&mut selector, &records));
    }

    #[test]
    fn first_conclusion_is_a_transition_even_when_none() {
        let mut selector = PrimarySelector::new();
        assert!(run(&mut selector, &[record("i1", false, None)]));
        assert_eq!(selector.effective(), None);
    }

    #[test]
    fn reset_forgets_the_previous_primary() {
        let mut selector = PrimarySelector::new();
        run(&mut selector, &[record("i1", true, Some(true))]);
        selector.reset();
        assert_eq!(selector.effective(), None);

        // After reset, sticky rules do not apply to the old id.
        let records = [
            record("i2", true, Some(true)),
            record("i1", true, Some(true)),
        ];
        assert!(run(&mut selector, &records));
        assert_eq!(selector.effective(), Some("i2"));
    }
}

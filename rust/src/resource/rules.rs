//! State-dependent admission rules: suspend, ODT, cache and EPR.

use crate::catalog::{BaseId, Operation};
use crate::types::{Address, Axis, SimTime};

use super::overlay::{AddressOverlay, EprPolicy, EprQuery};
use super::txn::Transaction;
use super::types::RejectReason;
use super::{target_dies, ResourceManager};

impl ResourceManager {
    /// First state rule that forbids `base` on `targets` at `t`, if any.
    ///
    /// Cheap enough to run before address sampling.
    pub fn state_block(&self, base: BaseId, targets: &[Address], t: SimTime) -> Option<RejectReason> {
        let features = &self.catalog.features;
        if features.suspend_rules {
            for die in target_dies(targets) {
                for axis in [Axis::Erase, Axis::Program] {
                    let state = self.suspend_state(die, axis, t);
                    if self.catalog.forbidden_by_suspend(state, base) {
                        return Some(RejectReason::StateForbidSuspend);
                    }
                }
            }
        }
        if features.odt_rules && self.catalog.forbidden_by_odt(self.odt_state(), base) {
            return Some(RejectReason::StateForbidOdt);
        }
        if features.cache_rules {
            for a in targets {
                if let Some(state) = self.cache_state(a.die, a.plane, t) {
                    if self.catalog.forbidden_by_cache(state, base) {
                        return Some(RejectReason::StateForbidCache);
                    }
                }
            }
        }
        None
    }

    pub(super) fn check_rules(
        &self,
        txn: Option<&Transaction>,
        op: &Operation,
        targets: &[Address],
        start: SimTime,
        epr: Option<&dyn EprPolicy>,
    ) -> Result<(), RejectReason> {
        if let Some(reason) = self.state_block(op.base, targets, start) {
            return Err(reason);
        }
        if !self.catalog.features.epr_rules {
            return Ok(());
        }
        let Some(policy) = epr else {
            return Ok(());
        };
        let spec = self.catalog.base(op.base);
        let query = EprQuery {
            base: &spec.name,
            family: spec.family,
            targets,
            celltype: op.celltype.as_deref(),
        };
        let empty = AddressOverlay::default();
        let overlay = txn.map_or(&empty, |t| &t.overlay);
        let verdict = policy.check_epr(&query, overlay);
        if verdict.ok() {
            Ok(())
        } else {
            Err(RejectReason::EprDep)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{manager, manager_with, op};
    use super::super::{EprFailure, EprVerdict};
    use super::*;
    use crate::config::SimConfig;
    use crate::types::Scope;

    struct DenyAll;

    impl EprPolicy for DenyAll {
        fn check_epr(&self, query: &EprQuery<'_>, _overlay: &AddressOverlay) -> EprVerdict {
            EprVerdict {
                failures: query
                    .targets
                    .iter()
                    .map(|a| EprFailure::BadBlock(*a))
                    .collect(),
            }
        }
    }

    #[test]
    fn test_epr_policy_is_consulted() {
        let rm = manager();
        let read = op(&rm, "Read_SLC");
        let target = [Address::new(0, 0, 0, Some(0))];
        assert_eq!(
            rm.evaluate(None, &read, &target, Scope::PlaneSet, 0.0, Some(&DenyAll)),
            Err(RejectReason::EprDep)
        );
        assert!(rm
            .evaluate(None, &read, &target, Scope::PlaneSet, 0.0, None)
            .is_ok());
    }

    #[test]
    fn test_disabled_features_skip_rules() {
        let mut config = SimConfig::reference();
        config.features.epr_rules = false;
        config.features.suspend_rules = false;
        let rm = manager_with(config);
        let read = op(&rm, "Read_SLC");
        let target = [Address::new(0, 0, 0, Some(0))];
        assert!(rm
            .evaluate(None, &read, &target, Scope::PlaneSet, 0.0, Some(&DenyAll))
            .is_ok());

        // Resume is normally forbidden while nothing is suspended
        let resume = rm.catalog().base_id("ERASE_RESUME").unwrap();
        assert_eq!(rm.state_block(resume, &target, 0.0), None);
    }

    #[test]
    fn test_resume_forbidden_when_not_suspended() {
        let rm = manager();
        let resume = rm.catalog().base_id("ERASE_RESUME").unwrap();
        assert_eq!(
            rm.state_block(resume, &[Address::block(0, 0, 0)], 0.0),
            Some(RejectReason::StateForbidSuspend)
        );
    }
}

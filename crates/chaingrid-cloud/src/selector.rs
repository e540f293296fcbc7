//! Decides which setups to instantiate.
//!
//! The selector never creates anything. It reads VM counts from the
//! [`VmRegistry`] and returns a list of setups, one entry per VM that
//! should be created. Setups are considered in the order given and each
//! one is used up before moving on to the next.

use std::sync::Arc;

use chaingrid_state::{CapabilitySet, PoolAgentParams, Setup, Vm, VmRegistry};
use tracing::trace;

use crate::error::CloudResult;

// ── Pool tally ─────────────────────────────────────────────────────

/// Running count of VMs per agent pool, used to keep every pool below
/// its maximum while a selection is being built.
struct PoolTally<'a> {
    pools: &'a [PoolAgentParams],
    counts: Vec<u64>,
}

impl<'a> PoolTally<'a> {
    fn empty(pools: &'a [PoolAgentParams]) -> Self {
        Self {
            pools,
            counts: vec![0; pools.len()],
        }
    }

    fn with_existing(pools: &'a [PoolAgentParams], vms: &[Vm]) -> Self {
        let mut tally = Self::empty(pools);
        for vm in vms {
            tally.add(&vm.setup);
        }
        tally
    }

    /// Pools a VM of `setup` counts towards.
    fn covering<'s>(&'s self, setup: &'s Setup) -> impl Iterator<Item = usize> + 's {
        self.pools
            .iter()
            .enumerate()
            .filter(|(_, p)| p.capabilities.is_subset_of(&setup.provided_capabilities))
            .map(|(i, _)| i)
    }

    fn admits(&self, setup: &Setup) -> bool {
        self.covering(setup).all(|i| {
            self.pools[i]
                .max
                .is_none_or(|max| self.counts[i] < u64::from(max))
        })
    }

    fn add(&mut self, setup: &Setup) {
        let covering: Vec<usize> = self.covering(setup).collect();
        for i in covering {
            self.counts[i] += 1;
        }
    }
}

// ── Selector ───────────────────────────────────────────────────────

pub struct SetupSelector {
    vms: Arc<dyn VmRegistry>,
    pools: Vec<PoolAgentParams>,
}

impl SetupSelector {
    pub fn new(vms: Arc<dyn VmRegistry>, pools: Vec<PoolAgentParams>) -> Self {
        Self { vms, pools }
    }

    pub fn pools(&self) -> &[PoolAgentParams] {
        &self.pools
    }

    /// Select up to `n` setups providing `required`. VMs that are already
    /// starting count towards `n`. Per setup, neither `max_vms` nor
    /// `max_create_concurrent` is exceeded, and no agent pool grows past
    /// its maximum.
    pub async fn select(
        &self,
        n: u64,
        required: &CapabilitySet,
        setups: &[Setup],
    ) -> CloudResult<Vec<Setup>> {
        let candidates: Vec<&Setup> = setups
            .iter()
            .filter(|s| s.provided_capabilities.is_superset_of(required))
            .collect();
        if candidates.is_empty() || n == 0 {
            return Ok(Vec::new());
        }

        let mut counts = Vec::with_capacity(candidates.len());
        for setup in &candidates {
            let non_terminated = self.vms.count_non_terminated_vms_by_setup(&setup.id).await?;
            let starting = self.vms.count_starting_vms_by_setup(&setup.id).await?;
            counts.push((non_terminated, starting));
        }

        let already_starting: u64 = counts.iter().map(|(_, starting)| starting).sum();
        let mut remaining = n.saturating_sub(already_starting);

        let existing = if self.pools.is_empty() {
            Vec::new()
        } else {
            self.vms.find_non_terminated_vms().await?
        };
        let mut tally = PoolTally::with_existing(&self.pools, &existing);

        let mut selected = Vec::new();
        for (setup, (non_terminated, starting)) in candidates.into_iter().zip(counts) {
            let mut taken = 0u64;
            while remaining > 0
                && non_terminated + taken < u64::from(setup.max_vms)
                && starting + taken < u64::from(setup.max_create_concurrent())
                && tally.admits(setup)
            {
                tally.add(setup);
                selected.push(setup.clone());
                taken += 1;
                remaining -= 1;
            }
            if remaining == 0 {
                break;
            }
        }

        trace!(n, required = %required, selected = selected.len(), "setups selected");
        Ok(selected)
    }

    /// Whether one more VM of `setup` fits the setup's own limits and
    /// every pool it counts towards.
    pub async fn has_capacity(&self, setup: &Setup) -> CloudResult<bool> {
        let non_terminated = self.vms.count_non_terminated_vms_by_setup(&setup.id).await?;
        let starting = self.vms.count_starting_vms_by_setup(&setup.id).await?;
        if non_terminated >= u64::from(setup.max_vms)
            || starting >= u64::from(setup.max_create_concurrent())
        {
            return Ok(false);
        }
        if self.pools.is_empty() {
            return Ok(true);
        }
        let existing = self.vms.find_non_terminated_vms().await?;
        Ok(PoolTally::with_existing(&self.pools, &existing).admits(setup))
    }

    /// Setups needed to satisfy every pool's `min` and every setup's
    /// `min_vms`. A VM that counts towards several overlapping pools is
    /// only selected once. With `exclude_existing`, VMs that are already
    /// there are deducted from the result.
    pub async fn select_minimum(
        &self,
        setups: &[Setup],
        exclude_existing: bool,
    ) -> CloudResult<Vec<Setup>> {
        let mut tally = PoolTally::empty(&self.pools);
        let mut selected: Vec<Setup> = Vec::new();

        let count_of = |selected: &[Setup], setup: &Setup| -> u64 {
            selected.iter().filter(|s| s.id == setup.id).count() as u64
        };

        for pool in &self.pools {
            let satisfied = selected
                .iter()
                .filter(|s| s.provided_capabilities.is_superset_of(&pool.capabilities))
                .count() as u64;
            let mut deficit = u64::from(pool.min).saturating_sub(satisfied);
            for setup in setups
                .iter()
                .filter(|s| s.provided_capabilities.is_superset_of(&pool.capabilities))
            {
                while deficit > 0
                    && count_of(&selected, setup) < u64::from(setup.max_vms)
                    && tally.admits(setup)
                {
                    tally.add(setup);
                    selected.push(setup.clone());
                    deficit -= 1;
                }
                if deficit == 0 {
                    break;
                }
            }
        }

        for setup in setups {
            let mut deficit = u64::from(setup.min_vms).saturating_sub(count_of(&selected, setup));
            while deficit > 0
                && count_of(&selected, setup) < u64::from(setup.max_vms)
                && tally.admits(setup)
            {
                tally.add(setup);
                selected.push(setup.clone());
                deficit -= 1;
            }
        }

        if exclude_existing {
            for vm in self.vms.find_non_terminated_vms().await? {
                if let Some(pos) = selected.iter().position(|s| s.id == vm.setup.id) {
                    selected.remove(pos);
                }
            }
        }

        Ok(selected)
    }
}

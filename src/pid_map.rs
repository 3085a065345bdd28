//! Mapping between kernel-internal thread ids and user-visible (pid, tid) pairs.
//!
//! Scheduling events recorded from inside a pid namespace reference threads by
//! the id the kernel uses internally (the "inner" id, as seen from the root
//! namespace), while the output document must use the pid/tid pair a user of
//! the traced system would recognize. The association between the two is only
//! learned incrementally, from records that happen to carry both forms.
//!
//! # First write wins
//!
//! A mapping is established at most once per inner id. Later evidence with a
//! different outer pair is ignored, never an overwrite: direct evidence
//! (runtime-stat records) arrives before the end-of-stream heuristics run, and
//! an established identity must not be "corrected" by weaker evidence.
//! Tentative associations go through [`PidMapper::backup`] instead and are
//! only promoted for inner ids still unresolved when the stream ends.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Bidirectional inner-id ↔ (outer pid, outer tid) mapping, plus display
/// names and pseudo-pid allocation for the synthetic output tracks.
#[derive(Debug, Default)]
pub struct PidMapper {
    /// Established inner id -> (opid, otid). Never overwritten.
    in2out: HashMap<i64, (i64, i64)>,
    /// Reverse of `in2out`.
    out2in: HashMap<(i64, i64), i64>,
    /// Tentative inner id -> (opid, otid), freely overwritten; promoted at
    /// end of stream for inner ids with no established mapping. Sorted so
    /// the drain is deterministic.
    backups: BTreeMap<i64, (i64, i64)>,
    /// Inner id -> first-seen display name (comm).
    names: HashMap<i64, String>,
    /// Outer pids that made it into the output.
    opids_seen: HashSet<i64>,
    /// Allocated pseudo pids, disjoint from every observed opid.
    pseudo_pids: BTreeSet<i64>,
}

impl PidMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to establish the mapping from `inner` to `(opid, otid)`. Returns
    /// whether a new association was created; callers use this to trigger a
    /// replay of events buffered against `inner`. An opid of 0 carries no
    /// identity and never maps.
    pub fn resolve(&mut self, inner: i64, opid: i64, otid: i64) -> bool {
        if self.in2out.contains_key(&inner) || opid == 0 {
            return false;
        }
        self.in2out.insert(inner, (opid, otid));
        self.out2in.insert((opid, otid), inner);
        true
    }

    /// Record a tentative association for `inner`. Last backup wins.
    pub fn backup(&mut self, inner: i64, opid: i64, otid: i64) {
        self.backups.insert(inner, (opid, otid));
    }

    /// Take every backup whose inner id is still unresolved, in inner-id
    /// order. Called exactly once, at finalization.
    pub fn drain_backups(&mut self) -> Vec<(i64, i64, i64)> {
        std::mem::take(&mut self.backups)
            .into_iter()
            .filter(|(inner, _)| !self.in2out.contains_key(inner))
            .map(|(inner, (opid, otid))| (inner, opid, otid))
            .collect()
    }

    /// Map an inner id to its outer pair, recording the opid as observed.
    pub fn lookup_outer(&mut self, inner: i64) -> Option<(i64, i64)> {
        let &(opid, otid) = self.in2out.get(&inner)?;
        self.opids_seen.insert(opid);
        Some((opid, otid))
    }

    /// Map an outer pair back to its inner id.
    pub fn lookup_inner(&self, opid: i64, otid: i64) -> Option<i64> {
        self.out2in.get(&(opid, otid)).copied()
    }

    /// Associate a display name with an inner id. First name wins.
    pub fn record_name(&mut self, inner: i64, name: &str) {
        self.names.entry(inner).or_insert_with(|| name.to_string());
    }

    /// Look up the display name for an inner id.
    pub fn name(&self, inner: i64) -> Option<&str> {
        self.names.get(&inner).map(String::as_str)
    }

    /// Outer pids observed in the output so far.
    pub fn observed_opids(&self) -> impl Iterator<Item = i64> + '_ {
        self.opids_seen.iter().copied()
    }

    /// All allocated pseudo pids, in allocation-independent sorted order.
    pub fn pseudo_opids(&self) -> impl Iterator<Item = i64> + '_ {
        self.pseudo_pids.iter().copied()
    }

    /// Allocate a low pid guaranteed not to clash with any observed opid or
    /// previously allocated pseudo pid. Scans up from 0; no reuse.
    pub fn allocate_pseudo_id(&mut self) -> i64 {
        let mut pid = 0;
        while self.pseudo_pids.contains(&pid) || self.opids_seen.contains(&pid) {
            pid += 1;
        }
        self.pseudo_pids.insert(pid);
        pid
    }
}

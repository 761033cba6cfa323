//! Minimal in-memory patch/sample registry.
//!
//! Stands in for the external patch loader described by the Non-goals: this
//! crate does not parse GUS patch banks or decode sample PCM data, but the
//! event handlers (note-on, program change, drum-track sysex, resets) are
//! real collaborators of *some* patch registry, so a small one is provided
//! here to make the core independently testable.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// A loaded instrument sample's envelope and pitch metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Divisor applied to the computed phase increment.
    pub inc_div: u32,
    /// Mode bits copied onto a voice at note-on (`SampleModes`).
    pub modes: crate::voice::SampleModes,
    /// Per-stage envelope rate, indexed by envelope stage 0..6.
    pub env_rate: [u32; 7],
    /// Per-stage envelope target amplitude, indexed by envelope stage 0..6.
    pub env_target: [i32; 7],
}

impl Sample {
    /// A sample with a flat non-enveloped playback profile; useful as a test fixture.
    pub fn flat(inc_div: u32) -> Self {
        Self {
            inc_div,
            modes: crate::voice::SampleModes::empty(),
            env_rate: [0; 7],
            env_target: [0; 7],
        }
    }
}

/// A patch: one or more samples, an amplitude trim, and an optional fixed root note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    /// `(bank << 8) | program`, or `(bank << 8) | note | 0x80` for drum patches.
    pub patch_id: u32,
    /// Amplitude scale applied on top of the volume kernel, in percent.
    pub amp: i32,
    /// Fixed MIDI note this patch always plays at, or 0 to use the requested note.
    pub note: u8,
    /// Samples keyed by the root frequency band they cover (`freq / 100`).
    samples: HashMap<u32, Arc<Sample>>,
}

impl Patch {
    /// Builds a patch that answers every frequency-band lookup with the same sample.
    pub fn single_sample(patch_id: u32, amp: i32, note: u8, sample: Sample) -> Self {
        let mut samples = HashMap::new();
        samples.insert(0, Arc::new(sample));
        Self { patch_id, amp, note, samples }
    }

    /// Resolves the sample covering the given root-frequency band.
    ///
    /// The real engine selects among several bands per patch; this minimal
    /// registry stores at most one, so lookup is a presence check after the
    /// external (out-of-scope) loader would normally have narrowed the band.
    pub fn sample_for_freq_band(&self, _band: u32) -> Option<Arc<Sample>> {
        self.samples.get(&0).cloned()
    }
}

struct Entry {
    patch: Arc<Patch>,
    refcount: u32,
}

/// Process-wide, mutex-guarded, refcounted patch table.
///
/// Guards only the reference-counting boundaries (patch resolve and instance
/// free); handlers never lock it directly, they go through a cached `Arc`.
#[derive(Default)]
pub struct PatchRegistry {
    inner: Mutex<HashMap<u32, Entry>>,
}

impl PatchRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a patch under its id if absent, then bumps its refcount.
    /// Returns the shared patch handle.
    pub fn load(&self, patch: Patch) -> Arc<Patch> {
        let mut guard = self.inner.lock();
        let entry = guard.entry(patch.patch_id).or_insert_with(|| Entry {
            patch: Arc::new(patch),
            refcount: 0,
        });
        entry.refcount += 1;
        entry.patch.clone()
    }

    /// Looks up a patch by id without changing its refcount.
    pub fn get(&self, patch_id: u32) -> Option<Arc<Patch>> {
        self.inner.lock().get(&patch_id).map(|e| e.patch.clone())
    }

    /// Looks up an already-resident patch by id and bumps its refcount.
    ///
    /// This is what a handler calls to take its own reference to a patch some
    /// external loader already registered via [`PatchRegistry::load`]; unlike
    /// `load`, it never inserts a new entry.
    pub fn acquire(&self, patch_id: u32) -> Option<Arc<Patch>> {
        let mut guard = self.inner.lock();
        let entry = guard.get_mut(&patch_id)?;
        entry.refcount += 1;
        Some(entry.patch.clone())
    }

    /// Decrements the refcount for `patch_id`, evicting it at zero.
    pub fn release(&self, patch_id: u32) {
        let mut guard = self.inner.lock();
        if let Some(entry) = guard.get_mut(&patch_id) {
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount == 0 {
                guard.remove(&patch_id);
            }
        }
    }

    /// Number of distinct patches currently resident, for tests.
    pub fn resident_count(&self) -> usize {
        self.inner.lock().len()
    }
}

/// One step of an atomic compound operation (§6.1 "Atomic compound
/// operations"). A `Vec<Op>` passed to `ObjectStore::operate` is applied
/// as a single all-or-nothing transaction.
#[derive(Debug, Clone)]
pub enum Op {
    /// Fails the whole operation unless the object's current version
    /// equals `expect`. This is the CAS primitive §4.2's generations
    /// manager and §4.5's layout commit rely on.
    AssertVersion(u64),
    /// Fails unless the object does not yet exist.
    CreateExclusive,
    /// Fails unless the object exists.
    AssertExists,
    SetAttr(String, Vec<u8>),
    RemoveAttr(String),
    WriteFull(Vec<u8>),
    OmapSet(Vec<(String, Vec<u8>)>),
    OmapRemoveKeys(Vec<String>),
    /// Removes all omap keys in `[from, to]` inclusive — used by log
    /// trim (§4.1) and by empty-generation cleanup (§4.2).
    OmapRemoveRange { from: String, to: String },
    Remove,
}

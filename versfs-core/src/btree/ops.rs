//! The leaf-operator contract. The engine is generic over this
//! trait and never looks inside a leaf except through it.

/// Returned by `expand` when the leaf has no room for the new entry; the
/// engine responds by splitting the leaf and retrying.
#[derive(Debug)]
pub struct LeafFull;

pub trait LeafOps {
    type Value: Clone;

    /// Confirm the block is a leaf of this kind (magic + header).
    fn sniff(leaf: &[u8]) -> bool;

    /// Format an empty leaf.
    fn init(leaf: &mut [u8]);

    /// Move the upper half of `src` into empty `dst`; return the smallest
    /// key now in `dst`. `fudge`, when given, biases the split so that the
    /// named key is likely to land with `extra` bytes of room to spare —
    /// used when the caller already knows it will immediately expand at
    /// that key.
    fn split(src: &mut [u8], dst: &mut [u8], fudge: Option<(u64, usize)>) -> u64;

    /// Reserve room for `value` at `key` and write it. `Err(LeafFull)` if
    /// the leaf cannot fit it.
    fn expand(leaf: &mut [u8], key: u64, value: &Self::Value) -> Result<(), LeafFull>;

    /// Locate the entry covering `key`; the second element of the tuple is
    /// the run length the entry spans (e.g. an extent's block count).
    /// `None` means absent.
    fn lookup(leaf: &[u8], key: u64) -> Option<(Self::Value, u32)>;

    /// The smallest key stored in the leaf, or `None` if it's empty —
    /// used by pivot maintenance after a chop changes a leaf's minimum.
    fn first_key(leaf: &[u8]) -> Option<u64>;

    /// Delete keys in `[from, to)`. Returns `true` if the leaf is now
    /// empty of entries.
    fn chop(leaf: &mut [u8], from: u64, to: u64) -> bool;

    /// Bytes currently used by live entries (for merge-fit decisions).
    fn used(leaf: &[u8]) -> usize;

    /// Bytes still free.
    fn free(leaf: &[u8]) -> usize;

    /// Append `src`'s entries onto `dst`. Only called when `Self::used(src)
    /// <= Self::free(dst)` — i.e. always expected to succeed.
    fn merge(dst: &mut [u8], src: &[u8]);

    /// Byte cost of storing one entry of this value — used by the extent
    /// write planner's fit check before committing an allocation.
    fn entry_size(value: &Self::Value) -> usize;
}

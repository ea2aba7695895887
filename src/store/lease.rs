//! NOWAIT lease word
//!
//! ```text
//! ┌───────────────────────┬───────────┬───────┐
//! │ lease end (55 bits)   │ owner (8) │ w (1) │
//! └───────────────────────┴───────────┴───────┘
//! ```
//!
//! A shared (read) lease stores its end time. While only the reader that
//! installed it relies on it, the owner bits hold that machine's id plus one;
//! the first reader to join clears them, after which nobody may hand the
//! lease back and it simply runs out. An exclusive (write) lock stores the
//! owning machine and sets the `w` bit, leaving the end time at zero. A zero
//! word is free.

/// Exclusive-lock bit
pub const W_LOCKED: u64 = 1;

const END_SHIFT: u32 = 9;
const OWNER_MASK: u64 = 0xff;

/// Shared lease expiring at `end_us`
pub fn r_lease(end_us: u64) -> u64 {
    end_us << END_SHIFT
}

/// Shared lease expiring at `end_us`, installed by machine `owner` alone
///
/// Machine ids stop at 254, so the tag never wraps to zero.
pub fn r_lease_by(end_us: u64, owner: u8) -> u64 {
    r_lease(end_us) | (((owner as u64 + 1) & OWNER_MASK) << 1)
}

/// Machine that installed a shared lease nobody has joined yet
pub fn sole_reader(word: u64) -> Option<u8> {
    if is_write_locked(word) {
        return None;
    }
    let tag = (word >> 1) & OWNER_MASK;
    (tag != 0).then(|| (tag - 1) as u8)
}

/// End time of a shared lease word
pub fn end_time(word: u64) -> u64 {
    word >> END_SHIFT
}

/// Exclusive lock word owned by machine `owner`
pub fn locked(owner: u8) -> u64 {
    ((owner as u64 & OWNER_MASK) << 1) | W_LOCKED
}

pub fn is_write_locked(word: u64) -> bool {
    word & W_LOCKED == W_LOCKED
}

/// Machine holding the exclusive lock, if any
pub fn owner(word: u64) -> Option<u8> {
    is_write_locked(word).then(|| ((word >> 1) & OWNER_MASK) as u8)
}

/// The lease ended long enough ago that no machine can still rely on it
pub fn expired(now_us: u64, end_us: u64, delta_us: u64) -> bool {
    now_us > end_us.saturating_add(delta_us)
}

/// The lease is still safe to rely on, even on a machine running `delta_us` ahead
pub fn valid(now_us: u64, end_us: u64, delta_us: u64) -> bool {
    now_us < end_us.saturating_sub(delta_us)
}

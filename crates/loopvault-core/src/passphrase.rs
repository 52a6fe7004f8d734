//! Capability for collecting the volume passphrase from the operator.

use zeroize::Zeroizing;

/// Secret bytes, wiped on drop.
pub type Passphrase = Zeroizing<Vec<u8>>;

/// Synchronous passphrase collection.
///
/// `request` blocks the calling thread until the operator responds.
/// `None` means the operator cancelled; the caller must stop asking.
pub trait PassphraseSource {
    fn request(&mut self) -> Option<Passphrase>;
}

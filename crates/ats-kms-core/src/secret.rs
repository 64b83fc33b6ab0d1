//! Zeroize-on-drop secret buffers
//!
//! The Master Secret, peppers, derived KEKs, and exported PKCS#8 documents
//! all live in [`SecretBytes`] so every exit path, including early `?`
//! returns, overwrites the bytes before the allocation is released.

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Heap-backed secret byte buffer, wiped on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    /// Take ownership of existing bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Copy from a slice
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Allocate a zeroed buffer of the given length
    pub fn zeroed(len: usize) -> Self {
        Self(vec![0u8; len])
    }

    /// Borrow the secret bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Mutably borrow the secret bytes
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for SecretBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// Debug must never print the contents.
impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBytes({} bytes)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_contents() {
        let secret = SecretBytes::from_slice(b"hunter22!");
        let rendered = format!("{secret:?}");
        assert!(!rendered.contains("hunter22"));
        assert!(rendered.contains("9 bytes"));
    }
}

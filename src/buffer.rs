//! Fixed-width byte buffers laid out by a [`crate::field::FieldList`].

use std::hash::{Hash, Hasher};
use std::ops::Deref;

/// A composite key buffer: one fixed-width byte array per [`crate::field::FieldList`] used as
/// keys, hashed and compared as a whole.
#[derive(Debug, Clone, Eq)]
pub struct KeyBuffer(Box<[u8]>);

impl KeyBuffer {
    pub fn zeroed(width: usize) -> Self {
        Self(vec![0u8; width].into_boxed_slice())
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec().into_boxed_slice())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl Deref for KeyBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl PartialEq for KeyBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Hash for KeyBuffer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write(&self.0);
    }
}

/// A composite value buffer: one fixed-width byte array per [`crate::field::FieldList`] used as
/// aggregate values.
#[derive(Debug, Clone)]
pub struct ValueBuffer(Box<[u8]>);

impl ValueBuffer {
    pub fn zeroed(width: usize) -> Self {
        Self(vec![0u8; width].into_boxed_slice())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl Deref for ValueBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

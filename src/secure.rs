//! Byte buffers for secret material.
//!
//! [`SecureBytes`] zeroes its contents before releasing storage and asks the
//! OS to exclude the backing pages from swap. Page locking is best-effort:
//! when the request fails (unprivileged processes routinely hit the
//! `RLIMIT_MEMLOCK` ceiling) the buffer still works, it is just not pinned.

use std::fmt;

use zeroize::Zeroize;

/// An immutable byte buffer holding secret material.
///
/// Used for passphrases, private-key wire blobs and anything derived from
/// them. The contents are zeroed on drop and the backing pages are pinned
/// against paging where the platform allows it.
pub struct SecureBytes {
    buf: Vec<u8>,
}

impl SecureBytes {
    /// Wrap an existing buffer, taking ownership of its storage.
    pub fn new(buf: Vec<u8>) -> Self {
        lock_pages(&buf);
        Self { buf }
    }

    /// Copy a slice into freshly pinned storage.
    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(data.to_vec())
    }

    /// Borrow the contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Number of bytes held.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Drop for SecureBytes {
    fn drop(&mut self) {
        // Unpin first: zeroizing truncates the buffer, which would hide
        // the locked range from munlock.
        unlock_pages(&self.buf);
        self.buf.zeroize();
    }
}

impl Clone for SecureBytes {
    fn clone(&self) -> Self {
        Self::from_slice(&self.buf)
    }
}

impl std::ops::Deref for SecureBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl AsRef<[u8]> for SecureBytes {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl From<Vec<u8>> for SecureBytes {
    fn from(buf: Vec<u8>) -> Self {
        Self::new(buf)
    }
}

impl From<&[u8]> for SecureBytes {
    fn from(data: &[u8]) -> Self {
        Self::from_slice(data)
    }
}

impl PartialEq for SecureBytes {
    fn eq(&self, other: &Self) -> bool {
        self.buf == other.buf
    }
}

impl Eq for SecureBytes {}

// Contents never appear in logs or panic messages.
impl fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureBytes({} bytes)", self.buf.len())
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn lock_pages(buf: &[u8]) {
    if buf.is_empty() {
        return;
    }
    // SAFETY: the range is owned by `buf` for the duration of the call.
    let rc = unsafe { libc::mlock(buf.as_ptr().cast(), buf.len()) };
    if rc != 0 {
        tracing::debug!(
            len = buf.len(),
            errno = std::io::Error::last_os_error().raw_os_error(),
            "mlock failed, secret pages may be swapped"
        );
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn unlock_pages(buf: &[u8]) {
    if buf.is_empty() {
        return;
    }
    // SAFETY: same range that was passed to mlock.
    unsafe {
        libc::munlock(buf.as_ptr().cast(), buf.len());
    }
}

#[cfg(not(unix))]
fn lock_pages(_buf: &[u8]) {}

#[cfg(not(unix))]
fn unlock_pages(_buf: &[u8]) {}

//! Read path: `get()` and `value_size()`.
//!
//! A lookup probes the key table by hash, confirms the key bytes from
//! flash, then reads the entry copies in order. A copy that fails to
//! parse or verify latches the error flag and the next copy is tried;
//! only when every copy is bad does the read report `DataLoss`.

use log::warn;

use crate::keys::KeyState;
use crate::{Error, FlashMemory, KeyValueStore, Result, MAX_KEY_LENGTH};
use format::HEADER_SIZE;

impl<
        F: FlashMemory,
        const MAX_ENTRIES: usize,
        const MAX_SECTORS: usize,
        const REDUNDANCY: usize,
        const FORMAT_COUNT: usize,
    > KeyValueStore<'_, F, MAX_ENTRIES, MAX_SECTORS, REDUNDANCY, FORMAT_COUNT>
{
    /// Reads the value stored for `key` into `buffer`, returning the
    /// value length.
    ///
    /// With `verify_on_read` set, the whole record's checksum is checked
    /// before any bytes are handed out.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] — no such key, or it was deleted.
    /// - [`Error::DataLoss`] — every stored copy failed to read back.
    /// - [`Error::ResourceExhausted`] — `buffer` is shorter than the
    ///   value; the buffer receives the prefix that fits.
    /// - [`Error::FailedPrecondition`] — the store is not initialized.
    pub fn get(&mut self, key: &[u8], buffer: &mut [u8]) -> Result<usize> {
        self.check_initialized()?;
        check_key(key)?;

        let slot = self.find_slot(key)?.ok_or(Error::NotFound)?;
        let descriptor = *self.keys.get(slot).ok_or(Error::NotFound)?;
        if descriptor.state == KeyState::Deleted {
            return Err(Error::NotFound);
        }

        for &address in descriptor.addresses() {
            let (header, _size) = match self.load_entry(address, self.options.verify_on_read) {
                Ok(loaded) => loaded,
                Err(error) => {
                    warn!("copy of key at address {address} failed to read: {error}");
                    self.note_error();
                    continue;
                }
            };

            // The descriptor pointed here, so the entry must carry the
            // same key and transaction; anything else is stale flash.
            let key_length = usize::from(header.key_length);
            if header.transaction_id != descriptor.transaction_id
                || key_length != key.len()
                || &self.scratch[HEADER_SIZE..HEADER_SIZE + key_length] != key
            {
                self.note_error();
                continue;
            }

            let value_len = header.value_size();
            let value_start = HEADER_SIZE + key_length;
            let copied = value_len.min(buffer.len());
            buffer[..copied].copy_from_slice(&self.scratch[value_start..value_start + copied]);
            if copied < value_len {
                return Err(Error::ResourceExhausted);
            }
            return Ok(value_len);
        }

        warn!("no intact copy left for key of {} bytes", key.len());
        Err(Error::DataLoss)
    }

    /// Size of the value stored for `key`, without reading it.
    ///
    /// # Errors
    ///
    /// Same lookup errors as [`get`](Self::get).
    pub fn value_size(&mut self, key: &[u8]) -> Result<usize> {
        self.check_initialized()?;
        check_key(key)?;

        let slot = self.find_slot(key)?.ok_or(Error::NotFound)?;
        let descriptor = self.keys.get(slot).ok_or(Error::NotFound)?;
        match descriptor.state {
            KeyState::Deleted => Err(Error::NotFound),
            KeyState::Valid => Ok(descriptor.value_size().unwrap_or(0)),
        }
    }
}

/// Keys are 1..=255 opaque bytes.
pub(crate) fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

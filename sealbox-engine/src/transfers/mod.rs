//! Pipeline stages
//!
//! Each stage works on one job at a time and reports progress over a channel.
//! Stages return a [`StageError`](crate::error::StageError) instead of writing
//! failure states themselves; the coordinator decides what state a failed
//! job is left in.
//!
//! ## Module Structure
//!
//! - `cancel` - Cancel flag shared between a stage and its coordinator
//! - `progress` - Throttled, monotonic progress reporting
//! - `encrypt` - Cleartext file to ciphertext parts
//! - `upload` - Parts to the filehost, then verification
//! - `download` - Filehost to a local buffer file
//! - `decrypt` - Buffer file to cleartext output

mod cancel;
mod decrypt;
mod download;
mod encrypt;
mod progress;
mod upload;

pub use cancel::{CancelFlag, CancelReason};
pub use decrypt::{
    CopyDecrypt, DecryptStrategy, DecryptionContext, InPlaceDecrypt, probe_in_place,
    run_decryption, select_strategy,
};
pub use download::{buffer_path, run_download};
pub use encrypt::run_encryption;
pub use progress::ProgressReporter;
pub use upload::{UploadOutcome, run_upload, spawn_finalize};

use tokio::io::{AsyncRead, AsyncReadExt};

/// Fill `buf` from `reader`, stopping early only at end of input
///
/// Returns the number of bytes read.
pub(crate) async fn read_up_to<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

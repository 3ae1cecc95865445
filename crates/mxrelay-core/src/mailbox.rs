//! Local mailbox delivery.

use crate::dns::BoxFuture;
use crate::envelope::Envelope;
use mxrelay_smtp::Address;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

/// Delivers a message to one recipient at the local domain.
pub trait LocalDelivery: Send + Sync {
    /// Stores `envelope` for `recipient`.
    ///
    /// # Errors
    ///
    /// Returns an error if the message could not be stored.
    fn deliver<'a>(
        &'a self,
        envelope: &'a Envelope,
        recipient: &'a Address,
    ) -> BoxFuture<'a, io::Result<()>>;
}

/// One file per message under `<root>/<user>/<id>.eml`.
///
/// The file is written under a temporary name and renamed into place, so
/// readers never see a partial message.
#[derive(Debug, Clone)]
pub struct MailboxDir {
    root: PathBuf,
}

impl MailboxDir {
    /// Uses `root` as the top of the mailbox tree.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the file a message for `recipient` is stored in.
    ///
    /// # Errors
    ///
    /// Returns an error if the local part cannot be used as a directory
    /// name.
    pub fn path_for(&self, recipient: &Address, id: &str) -> io::Result<PathBuf> {
        let user = recipient.user();
        if user.starts_with('.') || user.contains(['/', '\\', '\0']) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unusable mailbox name {user:?}"),
            ));
        }
        Ok(self.root.join(user).join(format!("{id}.eml")))
    }

    /// Top of the mailbox tree.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl LocalDelivery for MailboxDir {
    fn deliver<'a>(
        &'a self,
        envelope: &'a Envelope,
        recipient: &'a Address,
    ) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let target = self.path_for(recipient, envelope.id())?;
            let tmp = target.with_extension("eml.tmp");
            if let Some(dir) = target.parent() {
                fs::create_dir_all(dir).await?;
            }

            let mut content = envelope.received_for(recipient).into_bytes();
            content.extend_from_slice(&envelope.body());
            fs::write(&tmp, &content).await?;
            fs::rename(&tmp, &target).await?;

            info!(recipient = %recipient, path = %target.display(), "delivered locally");
            Ok(())
        })
    }
}

pub mod entry;
pub mod filter;
pub mod ldap;
pub mod memory;

pub use entry::{fold, normalize_dn, Attributes, Entry, Modification};
pub use filter::Filter;
pub use ldap::{LdapConfig, LdapDirectory};
pub use memory::MemoryDirectory;

use async_trait::async_trait;
use mockall::automock;

use oxsync_slo::Result;

/// Directory store consumed by the cache refresh engine. Every call is
/// awaited one at a time by the engine; implementations own their
/// connection handling and timeouts.
#[automock]
#[async_trait]
pub trait Directory: Send + Sync {
    /// Reads one entry by DN, `None` when it does not exist.
    async fn find(&self, dn: &str) -> Result<Option<Entry>>;

    /// Subtree search under `base_dn`. `attributes` restricts the returned
    /// attributes (empty means all). At most `size_limit` entries are
    /// returned; anything beyond it is dropped without error. Without a
    /// limit the result is either complete or an error.
    async fn search(
        &self,
        base_dn: &str,
        filter: &Filter,
        attributes: &[String],
        size_limit: Option<usize>,
    ) -> Result<Vec<Entry>>;

    /// Adds a new entry; fails with a conflict when the DN is taken.
    async fn persist(&self, entry: &Entry) -> Result<()>;

    /// Applies modifications to an existing entry.
    async fn merge(&self, dn: &str, changes: &[Modification]) -> Result<()>;

    async fn remove(&self, dn: &str) -> Result<()>;

    async fn contains(&self, dn: &str) -> Result<bool>;
}

//! Resource assignment: virtual-user ordinal -> shared stream
//!
//! Users are split into contiguous, equally sized blocks, one block per stream.
//! With 300 users and 30 streams, ordinals 0..10 share stream index 0, 10..20
//! share index 1, and so on.

use crate::error::ConfigError;
use crate::identity::IdentityId;

/// Index of a resource within the run (0-based, `< total_resources`)
pub type ResourceId = usize;

/// Backend identifier of a chat stream
pub type StreamId = u64;

/// Map `ordinal` to its resource index.
///
/// Fails when `total_resources` does not evenly divide `total_users`. Ordinals at or
/// past `total_users` wrap, so the function is total over all ordinals.
pub fn assign(
    ordinal: usize,
    total_users: usize,
    total_resources: usize,
) -> Result<ResourceId, ConfigError> {
    let block = block_size(total_users, total_resources)?;
    Ok((ordinal % total_users) / block)
}

fn block_size(total_users: usize, total_resources: usize) -> Result<usize, ConfigError> {
    if total_users == 0 {
        return Err(ConfigError::Zero("identity count"));
    }
    if total_resources == 0 {
        return Err(ConfigError::Zero("stream count"));
    }
    if total_users % total_resources != 0 {
        return Err(ConfigError::UnevenPartition {
            users: total_users,
            resources: total_resources,
        });
    }
    Ok(total_users / total_resources)
}

/// Validated partition, checked once at setup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceAssignment {
    total_users: usize,
    total_resources: usize,
    block: usize,
}

impl ResourceAssignment {
    pub fn new(total_users: usize, total_resources: usize) -> Result<Self, ConfigError> {
        let block = block_size(total_users, total_resources)?;
        Ok(Self {
            total_users,
            total_resources,
            block,
        })
    }

    pub fn resource_for(&self, ordinal: IdentityId) -> ResourceId {
        (ordinal % self.total_users) / self.block
    }

    pub fn users_per_resource(&self) -> usize {
        self.block
    }

    pub fn total_resources(&self) -> usize {
        self.total_resources
    }

    pub fn total_users(&self) -> usize {
        self.total_users
    }
}

/// Resource index -> concrete stream id on the service under test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDirectory {
    ids: Vec<StreamId>,
}

impl StreamDirectory {
    pub fn new(ids: Vec<StreamId>) -> Self {
        Self { ids }
    }

    /// Streams numbered `1..=count`, used when no ids are configured
    pub fn sequential(count: usize) -> Self {
        Self {
            ids: (1..=count as StreamId).collect(),
        }
    }

    pub fn get(&self, resource: ResourceId) -> Option<StreamId> {
        self.ids.get(resource).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[StreamId] {
        &self.ids
    }
}

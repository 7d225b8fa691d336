//! Method policy registry shared by clients and servers.

use crate::channels;
use busrpc_types::{MethodPolicy, RpcError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Debug, Default)]
pub(crate) struct MethodRegistry {
    policies: DashMap<String, MethodPolicy>,
}

impl MethodRegistry {
    /// Record `policy` for `method`.
    ///
    /// Registering the same policy again is a no-op; a different one is
    /// `InvalidArgument`.
    pub(crate) fn register(&self, method: &str, policy: MethodPolicy) -> Result<(), RpcError> {
        channels::validate_segment("method", method)?;
        policy.validate()?;
        match self.policies.entry(method.to_string()) {
            Entry::Occupied(existing) if *existing.get() == policy => Ok(()),
            Entry::Occupied(existing) => Err(RpcError::invalid_argument(format!(
                "method {method} already registered with {:?}",
                existing.get()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(policy);
                Ok(())
            }
        }
    }

    pub(crate) fn get(&self, method: &str) -> Result<MethodPolicy, RpcError> {
        self.policies
            .get(method)
            .map(|policy| *policy)
            .ok_or_else(|| RpcError::invalid_argument(format!("method {method} not registered")))
    }
}

//! Integration scenarios and the fixtures they share.

pub mod rpc;
pub mod stream;

#[cfg(test)]
pub(crate) mod fixtures {
    use busrpc::{
        MessageBus, MethodPolicy, RpcClient, RpcServer, ServiceDefinition,
    };
    use busrpc_bus::{LocalMessageBus, RoutingMode};
    use std::sync::Arc;

    pub const SERVICE: &str = "calc";

    /// Every routing mode a backend may be built with.
    pub const MODES: [RoutingMode; 2] = [RoutingMode::Legacy, RoutingMode::Structured];

    pub fn bus(mode: RoutingMode) -> Arc<dyn MessageBus> {
        busrpc_telemetry::init_test_logging();
        Arc::new(LocalMessageBus::with_mode(mode))
    }

    pub fn client(bus: &Arc<dyn MessageBus>, method: &str, policy: MethodPolicy) -> RpcClient {
        let client = RpcClient::new(ServiceDefinition::client(SERVICE), bus.clone());
        client.register_method(method, policy).unwrap();
        client
    }

    pub fn server(bus: &Arc<dyn MessageBus>, method: &str, policy: MethodPolicy) -> RpcServer {
        let server = RpcServer::new(ServiceDefinition::server(SERVICE), bus.clone());
        server.register_method(method, policy).unwrap();
        server
    }
}

//! HandshakeNegotiator - the one-time `initialize` exchange.

use serde_json::json;

use super::rpc::RpcChannel;
use crate::api::config::AdapterOptions;
use crate::api::types::{ApiError, InitializeResult};

/// JSON-RPC method name for the initialize handshake
pub const METHOD_INITIALIZE: &str = "initialize";

const CLIENT_NAME: &str = env!("CARGO_PKG_NAME");

/// Send `initialize` and parse the agent's answer.
///
/// Every failure (transport, remote rejection, malformed response) comes
/// back as `HandshakeFailed`.
pub async fn negotiate(
    channel: &RpcChannel,
    options: &AdapterOptions,
) -> Result<InitializeResult, ApiError> {
    let params = json!({
        "protocolVersion": options.protocol_version,
        "clientCapabilities": {
            "fs": {
                "readTextFile": true,
                "writeTextFile": true
            },
            "terminal": options.advertise_terminal
        },
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION")
        }
    });

    log::debug!(
        "Sending initialize: protocol_version={}, terminal={}",
        options.protocol_version,
        options.advertise_terminal
    );

    let response = channel
        .request(METHOD_INITIALIZE, params)
        .await
        .map_err(|e| ApiError::HandshakeFailed {
            message: e.to_string(),
        })?;

    let result: InitializeResult =
        serde_json::from_value(response).map_err(|e| ApiError::HandshakeFailed {
            message: format!("Malformed initialize response: {e}"),
        })?;

    log::info!(
        "Handshake completed: protocol_version={}, auth_methods={}",
        result.protocol_version,
        result.auth_methods.len()
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::acp::transport::{Frame, FrameReader, FrameWriter};
    use serde_json::Value;
    use std::sync::Arc;

    /// Run `negotiate` against a one-shot agent answering with `answer`.
    async fn negotiate_with(
        answer: impl FnOnce(&Value) -> Value + Send + 'static,
    ) -> (Value, Result<InitializeResult, ApiError>) {
        let (client, agent) = tokio::io::duplex(4096);
        let (_client_read, client_write) = tokio::io::split(client);
        let (agent_read, _agent_write) = tokio::io::split(agent);

        let channel = Arc::new(RpcChannel::new(FrameWriter::new(client_write)));
        let mut agent_reader = FrameReader::new(agent_read);

        let call = tokio::spawn({
            let channel = channel.clone();
            async move { negotiate(&channel, &AdapterOptions::default()).await }
        });

        let Some(Frame::Message(request)) = agent_reader.next_frame().await.unwrap() else {
            panic!("expected initialize request");
        };
        let outcome = answer(&request);
        match outcome.get("error") {
            Some(error) => channel.complete(
                &request["id"],
                Err(serde_json::from_value(error.clone()).unwrap()),
            ),
            None => channel.complete(&request["id"], Ok(outcome)),
        }

        (request, call.await.unwrap())
    }

    #[tokio::test]
    async fn test_negotiate_declares_capabilities() {
        let (request, result) = negotiate_with(|_| {
            json!({"protocolVersion": 1, "authMethods": [{"id": "oauth", "name": "OAuth"}]})
        })
        .await;

        assert_eq!(request["method"], METHOD_INITIALIZE);
        assert_eq!(request["params"]["protocolVersion"], 1);
        assert_eq!(request["params"]["clientCapabilities"]["fs"]["readTextFile"], true);
        assert_eq!(request["params"]["clientCapabilities"]["terminal"], true);

        let result = result.unwrap();
        assert_eq!(result.protocol_version, 1);
        assert_eq!(result.auth_methods[0].id, "oauth");
    }

    #[tokio::test]
    async fn test_remote_rejection_is_handshake_failure() {
        let (_, result) =
            negotiate_with(|_| json!({"error": {"code": -32600, "message": "unsupported"}})).await;
        assert!(matches!(result, Err(ApiError::HandshakeFailed { .. })));
    }

    #[tokio::test]
    async fn test_out_of_range_version_is_handshake_failure() {
        let (_, result) = negotiate_with(|_| json!({"protocolVersion": 70000})).await;
        assert!(matches!(result, Err(ApiError::HandshakeFailed { .. })));
    }
}

//! Contract invocation gateway — the only door to the chain.
//!
//! Translates release/refund/mint decisions into `stellar contract invoke`
//! subprocess calls and normalizes every possible failure (missing binary,
//! non-zero exit, timeout, unparsable output) into a tagged error. Nothing
//! above this module knows how contracts are reached; the engine depends on
//! [`ContractGateway`] alone, and tests substitute a mock.
//!
//! ## Idempotency
//!
//! Every state-mutating invocation carries a caller-supplied idempotency
//! key. The contract rejects replays of an applied key with a
//! `duplicate_key` error; the gateway folds that acknowledgment into a
//! successful response (`duplicate: true`) so a retried call after a
//! timeout can never double-spend.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::{EngineError, Result};

/// Markers the contract emits when an idempotency key was already applied.
const DUPLICATE_KEY_MARKERS: [&str; 2] = ["duplicate_key", "DuplicateKey"];

/// Normalized result of a contract call.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayResponse {
    /// Decoded CLI output; `{"raw_output": …}` when it wasn't JSON.
    pub data: Value,
    /// The call was a replay the contract had already applied.
    pub duplicate: bool,
}

#[async_trait]
pub trait ContractGateway: Send + Sync {
    /// State-mutating invocation. Failures are retryable with the same key.
    async fn invoke(
        &self,
        contract_id: &str,
        method: &str,
        args: &[String],
        idempotency_key: &str,
    ) -> Result<GatewayResponse>;

    /// Read-only invocation; no transaction fee, no idempotency key.
    async fn query(
        &self,
        contract_id: &str,
        method: &str,
        args: &[String],
    ) -> Result<GatewayResponse>;
}

// ─────────────────────────────────────────────────────────
// CLI implementation
// ─────────────────────────────────────────────────────────

/// Gateway that shells out to the `stellar` CLI.
pub struct CliGateway {
    bin: String,
    source: String,
    network: String,
    invoke_timeout: Duration,
    query_timeout: Duration,
}

impl CliGateway {
    pub fn from_config(cfg: &Config) -> Self {
        CliGateway {
            bin: cfg.stellar_bin.clone(),
            source: cfg.admin_key.clone(),
            network: cfg.network.clone(),
            invoke_timeout: Duration::from_secs(cfg.invoke_timeout_secs),
            query_timeout: Duration::from_secs(cfg.query_timeout_secs),
        }
    }

    fn base_argv(&self, contract_id: &str, view: bool) -> Vec<String> {
        let mut argv = vec![
            "contract".to_string(),
            "invoke".to_string(),
            "--id".to_string(),
            contract_id.to_string(),
            "--source".to_string(),
            self.source.clone(),
            "--network".to_string(),
            self.network.clone(),
        ];
        if view {
            argv.push("--is-view".to_string());
        }
        argv.push("--".to_string());
        argv
    }

    async fn run(&self, argv: Vec<String>, timeout: Duration) -> Result<GatewayResponse> {
        debug!("gateway exec: {} {}", self.bin, argv.join(" "));

        let output = Command::new(&self.bin)
            .args(&argv)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, output).await {
            Err(_) => return Err(EngineError::GatewayTimeout(timeout.as_secs())),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::Gateway(format!(
                    "{} CLI not found; install with: cargo install stellar-cli",
                    self.bin
                )));
            }
            Ok(Err(e)) => return Err(EngineError::Gateway(format!("failed to launch CLI: {e}"))),
            Ok(Ok(out)) => out,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if DUPLICATE_KEY_MARKERS.iter().any(|m| stderr.contains(m)) {
                warn!("gateway: idempotency key already applied, treating as success");
                return Ok(GatewayResponse {
                    data: Value::Null,
                    duplicate: true,
                });
            }
            let reason = if stderr.is_empty() {
                "contract call failed".to_string()
            } else {
                stderr
            };
            return Err(EngineError::Gateway(reason));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let data = if stdout.is_empty() {
            json!({ "result": "success" })
        } else {
            serde_json::from_str(&stdout).unwrap_or_else(|_| json!({ "raw_output": stdout }))
        };

        Ok(GatewayResponse {
            data,
            duplicate: false,
        })
    }
}

#[async_trait]
impl ContractGateway for CliGateway {
    async fn invoke(
        &self,
        contract_id: &str,
        method: &str,
        args: &[String],
        idempotency_key: &str,
    ) -> Result<GatewayResponse> {
        let mut argv = self.base_argv(contract_id, false);
        argv.push(method.to_string());
        argv.extend(args.iter().cloned());
        argv.push("--idempotency_key".to_string());
        argv.push(idempotency_key.to_string());
        self.run(argv, self.invoke_timeout).await
    }

    async fn query(
        &self,
        contract_id: &str,
        method: &str,
        args: &[String],
    ) -> Result<GatewayResponse> {
        let mut argv = self.base_argv(contract_id, true);
        argv.push(method.to_string());
        argv.extend(args.iter().cloned());
        self.run(argv, self.query_timeout).await
    }
}

/// Convenience builder for `--flag value` argument pairs.
pub fn arg_pairs(pairs: &[(&str, String)]) -> Vec<String> {
    let mut out = Vec::with_capacity(pairs.len() * 2);
    for (flag, value) in pairs {
        out.push(format!("--{flag}"));
        out.push(value.clone());
    }
    out
}

// ─────────────────────────────────────────────────────────
// Test double
// ─────────────────────────────────────────────────────────

#[cfg(test)]
pub mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RecordedCall {
        pub contract_id: String,
        pub method: String,
        pub args: Vec<String>,
        pub idempotency_key: Option<String>,
    }

    /// Scriptable in-memory gateway. Pushed responses are consumed in
    /// order; with an empty script every call succeeds.
    #[derive(Default)]
    pub struct MockGateway {
        pub calls: Mutex<Vec<RecordedCall>>,
        script: Mutex<VecDeque<Result<GatewayResponse>>>,
    }

    impl MockGateway {
        pub fn push_response(&self, response: Result<GatewayResponse>) {
            self.script.lock().unwrap().push_back(response);
        }

        pub fn push_failure(&self, error: EngineError) {
            self.push_response(Err(error));
        }

        pub fn invocations(&self) -> Vec<RecordedCall> {
            self.calls.lock().unwrap().clone()
        }

        fn next(&self) -> Result<GatewayResponse> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Ok(GatewayResponse {
                        data: json!({ "result": "success" }),
                        duplicate: false,
                    })
                })
        }
    }

    #[async_trait]
    impl ContractGateway for MockGateway {
        async fn invoke(
            &self,
            contract_id: &str,
            method: &str,
            args: &[String],
            idempotency_key: &str,
        ) -> Result<GatewayResponse> {
            self.calls.lock().unwrap().push(RecordedCall {
                contract_id: contract_id.to_string(),
                method: method.to_string(),
                args: args.to_vec(),
                idempotency_key: Some(idempotency_key.to_string()),
            });
            self.next()
        }

        async fn query(
            &self,
            contract_id: &str,
            method: &str,
            args: &[String],
        ) -> Result<GatewayResponse> {
            self.calls.lock().unwrap().push(RecordedCall {
                contract_id: contract_id.to_string(),
                method: method.to_string(),
                args: args.to_vec(),
                idempotency_key: None,
            });
            self.next()
        }
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway_with_bin(bin: &str) -> CliGateway {
        CliGateway {
            bin: bin.to_string(),
            source: "admin".to_string(),
            network: "testnet".to_string(),
            invoke_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_a_tagged_failure() {
        let gw = gateway_with_bin("definitely-not-a-real-binary-5f3a");
        let err = gw
            .invoke("CCORE", "release_funds", &[], "release-c1-m0")
            .await
            .unwrap_err();
        match err {
            EngineError::Gateway(msg) => assert!(msg.contains("not found")),
            other => panic!("expected Gateway error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nonzero_exit_surfaces_as_gateway_error() {
        // `false` exits 1 with no output.
        let gw = gateway_with_bin("false");
        let err = gw.query("CCORE", "get_campaign", &[]).await.unwrap_err();
        assert!(matches!(err, EngineError::Gateway(_)));
    }

    #[tokio::test]
    async fn non_json_stdout_is_wrapped_not_rejected() {
        // `echo` succeeds and prints the argv back, which is not JSON.
        let gw = gateway_with_bin("echo");
        let resp = gw.query("CCORE", "get_campaign", &[]).await.unwrap();
        assert!(!resp.duplicate);
        assert!(resp.data.get("raw_output").is_some());
    }

    #[test]
    fn arg_pairs_builds_flag_value_sequences() {
        let args = arg_pairs(&[
            ("campaign_id", "7".to_string()),
            ("milestone_id", "0".to_string()),
        ]);
        assert_eq!(args, vec!["--campaign_id", "7", "--milestone_id", "0"]);
    }
}

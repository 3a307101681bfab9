//! chainsync-evm: Ethereum JSON-RPC chain source.
//!
//! ```text
//! EvmChainSource ──▶ RpcTransport (HttpRpcClient: rate limit → breaker → retry)
//!        └────────▶ decode_signed (EIP-2718 envelope, signer recovery)
//! ```

pub mod decode;
pub mod policy;
pub mod rpc;
pub mod source;

pub use decode::decode_signed;
pub use policy::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RateLimiter};
pub use rpc::{HttpClientConfig, HttpRpcClient, RpcTransport, TransportError};
pub use source::{block_from_json, parse_hex_u64, receipt_from_json, EvmChainSource};

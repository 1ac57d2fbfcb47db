pub mod client;
pub mod multicall;
pub mod processor;
pub mod read;
pub mod registry;
pub mod scan_state;
pub mod scanner;

// Re-exports for convenience
pub use client::{ChainRpc, ClientError, EvmClient, HttpConnector, RpcConnector};
pub use multicall::{Call, CallOutput, Multicall, MulticallError};
pub use read::{ReadError, ReadService};
pub use registry::{ContractHandle, ContractRegistry, Registration, RegistryError};
pub use scan_state::{FlushReport, ScanState, StoreError};
pub use scanner::{EventScanner, ScanError, ScanSettings};

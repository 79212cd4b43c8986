pub mod clock;
pub mod credentials;
pub mod gateway;
pub mod metrics;
pub mod quota;
pub mod relay;
pub mod sessions;
pub mod upstream;
pub mod usage_store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use credentials::{Claims, CredentialError, CredentialManager, CredentialPair, CredentialType};
pub use gateway::{Caller, GatewayError, GatewayPolicy, GatewayService, QueryResult};
pub use quota::QuotaLedger;
pub use relay::{EventSink, RelayOutcome, SinkClosed, StreamRelay};
pub use sessions::SessionStore;
pub use upstream::{EventStream, HttpResponder, ScriptedResponder, UpstreamError, UpstreamResponder};
pub use usage_store::{InMemoryUsageStore, RedisUsageStore, StoreError, UsageStore};

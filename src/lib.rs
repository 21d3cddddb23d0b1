pub mod billing;
pub mod cache;
mod error;
pub mod notify;
pub mod observability;
pub mod pricing;
pub mod relay;
pub mod settings;
pub mod store;
pub mod token_count;
pub mod types;
pub mod utils;

#[cfg(feature = "http")]
pub mod http;

pub use billing::{BillingState, QuotaEngine, Reservation, SettleOutcome};
pub use cache::{CacheError, KvCache, MemoryCache, QuotaLedger};
pub use error::{
    ErrorKind, OpenAiErrorDetail, OpenAiErrorResponse, RelayError, Result, StatusCodeMapping,
};
pub use notify::{
    Notifier, Notify, NotifyError, NotifyKind, NotifyQueue, NotifyTarget, TracingNotifier,
    WebhookNotifier,
};
pub use pricing::{PriceData, PricingMode, QuotaInfo};
pub use relay::{
    Adaptor, ApiType, BufferSink, ChannelMeta, ChannelSink, ClientSink, RelayEngine, RelayInfo,
    RelayMode, RelayOutcome, TextRequest, adaptor_for,
};
pub use settings::{RelaySettings, SettingsError, SettingsHandle};
pub use store::{
    ChannelRecord, ConsumeLog, MemoryStore, NotifyType, QuotaStore, StoreError, TokenRecord,
    UserRecord, UserSetting, UserStatus,
};
pub use types::{
    AudioFile, AudioRequest, ChatMessage, ChatRequest, EmbeddingRequest, ImageRequest,
    RerankRequest, TokenDetails, Usage,
};

#[cfg(feature = "cache-redis")]
pub use cache::RedisCache;
#[cfg(feature = "store-sqlite")]
pub use store::SqliteStore;

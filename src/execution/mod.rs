// Order execution: exchange adapters and the retrying gateway
pub mod exchange;
pub mod gateway;
pub mod http;
pub mod paper;

pub use exchange::{ExchangeClient, OrderSide, OrderState, OrderStatus};
pub use gateway::{ExecutionGateway, FillResult, OrderContext, OrderRequest, RetryPolicy};
pub use http::HttpExchange;
pub use paper::PaperExchange;

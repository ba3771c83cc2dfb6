pub mod adapters;
pub mod fetcher;
pub mod parse;

pub use adapters::{HomesComAdapter, RedfinAdapter, ZillowAdapter, default_registry};
pub use fetcher::ReqwestFetcher;

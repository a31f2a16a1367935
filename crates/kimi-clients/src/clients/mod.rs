pub(crate) mod mock;
pub(crate) mod moonshot;

pub use mock::MockMoonshotClient;
pub use moonshot::MoonshotClient;

pub mod clock;
pub mod domain;
pub mod error;
pub mod protocol;
pub mod quorum;
pub mod timer;
pub mod view;

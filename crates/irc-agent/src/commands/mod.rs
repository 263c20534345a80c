pub mod daemon;
pub mod paths;
pub mod send;
pub mod status;
pub mod stop;

pub mod errno_logging_tests;
pub mod isolation_tests;
pub mod lifecycle_tests;
pub mod signal_handling_tests;

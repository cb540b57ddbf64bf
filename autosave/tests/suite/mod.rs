// Aggregates all former standalone integration tests as modules.
mod debounce;
mod encryption;
mod lifecycle;
mod permission;
mod retry;

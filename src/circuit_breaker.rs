use failsafe::{backoff, failure_policy, Config, StateMachine};
use std::time::Duration;

/// Circuit breaker guarding state-store database calls.
pub type StateStoreBreaker =
    StateMachine<failure_policy::ConsecutiveFailures<backoff::Exponential>, ()>;

/// Creates the breaker wrapped around every Postgres state-store query.
///
/// After 5 consecutive failed queries the breaker opens and further calls
/// return `Error::Rejected` at once, so rate limiting and analytics degrade
/// to defaults instead of waiting on the pool timeout for every request.
/// It probes again after an exponential backoff of 10s growing to 60s.
pub fn create_state_store_circuit_breaker() -> StateStoreBreaker {
    let backoff_strategy = backoff::exponential(
        Duration::from_secs(10), // Initial delay
        Duration::from_secs(60), // Maximum delay
    );

    let failure_policy = failure_policy::consecutive_failures(5, backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}

//! rltest - run the bundled smoke tests against a server build
//!
//! ```bash
//! # Test a local build on a random port
//! rltest --server-path ./src/redis-server --randomize-ports
//!
//! # Only the keyspace suite, under valgrind
//! rltest -t Keyspace --use-valgrind
//!
//! # Against a server that is already running
//! rltest --env existing-env --existing-env-addr localhost:6379
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use rltest::env::ServerEnvFactory;

mod smoke;

fn main() -> ExitCode {
    rltest::run_harness(smoke::registry(), Arc::new(ServerEnvFactory))
}

#![allow(dead_code)]

use std::sync::Once;
use std::time::{Duration, Instant};

use p4::transport::FakeServer;
use p4::{Session, SessionBuilder};

pub const ADDRESS: &str = "perforce:1666";

static TRACING: Once = Once::new();

/// Routes `p4.*` logs to the test output when `RUST_LOG`-style debugging is wanted.
pub fn init_tracing() {
	TRACING.call_once(|| {
		let _ = tracing_subscriber::fmt().with_test_writer().with_target(true).try_init();
	});
}

/// Server with an `admin` account (password `pass`), its workspace and a small depot.
pub fn server() -> FakeServer {
	FakeServer::builder(ADDRESS)
		.user("admin", Some("pass"))
		.user("guest", None)
		.workspace("admin_ws")
		.depot_files([
			"//depot/main/a.txt",
			"//depot/main/b.txt",
			"//depot/main/src/lib.c",
			"//depot/rel/c.txt",
		])
		.build()
}

pub fn builder(server: &FakeServer) -> SessionBuilder {
	init_tracing();
	Session::builder(server.connector())
		.address(server.address())
		.user("admin")
		.password("pass")
		.workspace("admin_ws")
}

pub fn session(server: &FakeServer) -> Session {
	builder(server).build()
}

/// Polls `check` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
	let deadline = Instant::now() + timeout;
	while Instant::now() < deadline {
		if check() {
			return true;
		}
		std::thread::sleep(Duration::from_millis(5));
	}
	check()
}

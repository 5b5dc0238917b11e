mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use common::{server, session, wait_until};
use p4::{CommandId, Error};

#[test]
fn commands_from_many_threads_stay_isolated() {
	let server = server();
	let session = session(&server);
	let stop = Arc::new(AtomicBool::new(false));

	let churn = {
		let (session, stop) = (session.clone(), stop.clone());
		thread::spawn(move || {
			let mut spawned = 0u32;
			while !stop.load(Ordering::SeqCst) {
				let churn_session = session.clone();
				let id = CommandId(10_000 + spawned);
				thread::spawn(move || churn_session.run_command("noop", id, false, &[]).expect("churn noop should run"))
					.join()
					.expect("churn thread should not panic");
				session.release_command(id);
				spawned += 1;
			}
			spawned
		})
	};

	let workers: Vec<_> = (0..6u32)
		.map(|worker| {
			let session = session.clone();
			thread::spawn(move || {
				for round in 0..20u32 {
					let id = CommandId(worker * 100 + round);
					let ok = session.run_command("dirs", id, true, &["//depot/*"]).expect("dirs should run");
					assert!(ok);
					let dirs = session.tagged_output(id).expect("results kept");
					assert_eq!(dirs.len(), 2, "command {id} saw another command's output");
					assert!(session.release_command(id));
				}
			})
		})
		.collect();

	for worker in workers {
		worker.join().expect("worker should not panic");
	}
	stop.store(true, Ordering::SeqCst);
	let spawned = churn.join().expect("churn thread should not panic");

	assert!(spawned > 0);
	assert!(session.active_commands().is_empty());
	assert_eq!(server.connections_opened(), 1);
}

#[test]
fn running_id_cannot_be_reused() {
	let server = server();
	let session = session(&server);

	let running = {
		let session = session.clone();
		thread::spawn(move || session.run_command("wait", CommandId(5), false, &["300"]))
	};
	assert!(wait_until(Duration::from_secs(2), || session.active_commands().contains(&CommandId(5))));

	let err = session.run_command("noop", CommandId(5), false, &[]).expect_err("duplicate id should be refused");
	assert!(matches!(err, Error::DuplicateActiveId(CommandId(5))));

	assert!(running.join().expect("wait thread should not panic").expect("wait should run"));
	assert!(session.run_command("noop", CommandId(5), false, &[]).expect("finished id can be reused"));
}

#[test]
fn settings_changed_mid_flight_apply_to_the_next_command() {
	let server = server();
	let session = session(&server);

	let running = {
		let session = session.clone();
		thread::spawn(move || session.run_command("wait", CommandId(1), false, &["100"]))
	};
	assert!(wait_until(Duration::from_secs(2), || !server.executed().is_empty()));
	session.set_user("guest");
	session.set_password("");

	assert!(running.join().expect("wait thread should not panic").expect("running command keeps its connection"));
	session.run_command("info", CommandId(2), true, &[]).expect("info should run");

	let executed = server.executed();
	assert_eq!(executed[0].user, "admin");
	assert_eq!(executed[1].user, "guest");
	assert_ne!(executed[0].connection, executed[1].connection);
}

#[test]
fn auto_ids_do_not_collide_across_threads() {
	let server = server();
	let session = session(&server);

	let threads: Vec<_> = (0..8)
		.map(|_| {
			let session = session.clone();
			thread::spawn(move || {
				let id = session.next_command_id();
				session.run_command("noop", id, false, &[]).expect("noop should run");
				id
			})
		})
		.collect();
	let ids: Vec<CommandId> = threads.into_iter().map(|handle| handle.join().expect("thread should not panic")).collect();

	let mut unique = ids.clone();
	unique.sort();
	unique.dedup();
	assert_eq!(unique.len(), ids.len());
}

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Runs `fsh -p` over a piped script and returns its output and run time.
fn fsh(args: &[&str], script: &str) -> (Output, Duration) {
    let started = Instant::now();
    let mut child = Command::new(env!("CARGO_BIN_EXE_fsh"))
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("fsh should start");
    child
        .stdin
        .take()
        .unwrap()
        .write_all(script.as_bytes())
        .unwrap();
    let output = child.wait_with_output().unwrap();
    (output, started.elapsed())
}

/// Pids from the `[id] pid [pid]` background launch notices.
fn launched_pids(stdout: &str) -> Vec<Pid> {
    stdout
        .lines()
        .filter(|line| line.starts_with('[') && !line.contains("done"))
        .flat_map(|line| line.split_whitespace().skip(1))
        .filter_map(|pid| pid.parse().ok())
        .map(Pid::from_raw)
        .collect()
}

/// Polls `child` until it exits; kills it and fails after `limit`.
fn exit_within(child: &mut Child, limit: Duration) -> ExitStatus {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            panic!("fsh still running after {:?}", limit);
        }
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn die_kills_every_job_and_exits_zero() {
    let (output, elapsed) = fsh(&["-p"], "true # sleep 30 # sleep 30\ndie\n");
    assert_eq!(output.status.code(), Some(0));
    assert!(elapsed < Duration::from_secs(10));
    let stdout = String::from_utf8_lossy(&output.stdout);
    let pids = launched_pids(&stdout);
    assert_eq!(pids.len(), 2, "stdout was {:?}", stdout);
    for pid in pids {
        assert_eq!(signal::kill(pid, None), Err(Errno::ESRCH));
    }
}

#[test]
fn paired_jobs_are_all_killed() {
    let (output, _) = fsh(&["-p", "-2"], "true # sleep 30\ndie\n");
    assert_eq!(output.status.code(), Some(0));
    let pids = launched_pids(&String::from_utf8_lossy(&output.stdout));
    assert_eq!(pids.len(), 2);
    for pid in pids {
        assert_eq!(signal::kill(pid, None), Err(Errno::ESRCH));
    }
}

#[test]
fn waitall_blocks_for_background_jobs() {
    let (output, elapsed) = fsh(&["-p"], "true # sleep 1 # sleep 1\nwaitall\n");
    assert_eq!(output.status.code(), Some(0));
    assert!(elapsed >= Duration::from_millis(900), "took {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(10));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.matches("done sleep 1").count(), 2, "stdout was {:?}", stdout);
}

#[test]
fn end_of_input_terminates_background_jobs() {
    let (output, elapsed) = fsh(&["-p"], "echo hi # sleep 5 # sleep 5\n");
    assert_eq!(output.status.code(), Some(0));
    assert!(elapsed < Duration::from_secs(5));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("hi\n"), "stdout was {:?}", stdout);
    for pid in launched_pids(&stdout) {
        assert_eq!(signal::kill(pid, None), Err(Errno::ESRCH));
    }
}

#[test]
fn interpreter_mode_runs_whole_sub_command() {
    let (output, _) = fsh(&["-p", "-c"], "echo one; echo two\n");
    assert_eq!(String::from_utf8_lossy(&output.stdout), "one\ntwo\n");
}

#[test]
fn missing_program_is_reported_by_the_child() {
    let (output, _) = fsh(&["-p"], "fsh-no-such-program-here\n");
    assert_eq!(output.status.code(), Some(0));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cannot execute `fsh-no-such-program-here`"), "stderr was {:?}", stderr);
}

#[test]
fn help_exits_with_usage() {
    let (output, _) = fsh(&["-h"], "");
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("Usage: fsh"));
}

#[test]
fn confirmed_interrupt_terminates_jobs_and_exits() {
    let mut child = Command::new(env!("CARGO_BIN_EXE_fsh"))
        .arg("-p")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("fsh should start");
    let mut stdin = child.stdin.take().unwrap();
    let mut stdout = BufReader::new(child.stdout.take().unwrap());
    let mut stderr = child.stderr.take().unwrap();

    stdin.write_all(b"true # sleep 30\n").unwrap();
    let mut notice = String::new();
    stdout.read_line(&mut notice).unwrap();
    let pids = launched_pids(&notice);
    assert_eq!(pids.len(), 1, "stdout was {:?}", notice);

    signal::kill(Pid::from_raw(child.id() as i32), Signal::SIGINT).unwrap();
    let mut asked = Vec::new();
    let mut byte = [0u8; 1];
    while !String::from_utf8_lossy(&asked).contains("(y/n)") {
        let read = stderr.read(&mut byte).unwrap();
        assert_eq!(read, 1, "stderr was {:?}", String::from_utf8_lossy(&asked));
        asked.push(byte[0]);
    }
    stdin.write_all(b"y\n").unwrap();

    let status = exit_within(&mut child, Duration::from_secs(5));
    assert_eq!(status.code(), Some(0));
    let mut rest = String::new();
    stderr.read_to_string(&mut rest).unwrap();
    assert!(!rest.contains("cannot execute"), "stderr was {:?}", rest);
    assert_eq!(signal::kill(pids[0], None), Err(Errno::ESRCH));
}

use std::sync::{Arc, Mutex};
use std::time::Duration;
use stretch_core::{
    AxisAddress, Connection, DeviceError, Protocol, RunOutcome, Session, Transport,
};
use stretch_io::{AsciiConnection, SerialConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::runtime::{Builder, Runtime};

const AXIS: AxisAddress = AxisAddress::new(1, 1);

#[derive(Default)]
struct FakeState {
    position: i64,
    max_speed: i64,
    reject_moves: bool,
    chatter: bool,
    /// Holds back the reply to the next command with this body.
    slow_command: Option<(String, Duration)>,
    /// Commands as received, without their message ids.
    received: Vec<String>,
    ids: Vec<u8>,
}

/// A controller chain on the far end of an in-memory pipe.
async fn serve(stream: DuplexStream, devices: Vec<u8>, state: Arc<Mutex<FakeState>>) {
    let (rd, mut wr) = tokio::io::split(stream);
    let mut lines = BufReader::new(rd).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut out = String::new();
        let mut delay = None;
        {
            let mut s = state.lock().unwrap();
            let words: Vec<&str> = line.trim_start_matches('/').split_whitespace().collect();

            if words.is_empty() {
                s.received.push(line.clone());
                for d in &devices {
                    out.push_str(&format!("@{:02} 0 OK IDLE -- 0\r\n", d));
                }
            } else {
                let device: u8 = words[0].parse().unwrap();
                let axis: u8 = words[1].parse().unwrap();
                let id: Option<u8> = words.get(2).and_then(|w| w.parse().ok());
                let body = if id.is_some() { &words[3..] } else { &words[2..] };

                let mut plain = format!("/{} {}", device, axis);
                if !body.is_empty() {
                    plain.push(' ');
                    plain.push_str(&body.join(" "));
                }
                s.received.push(plain);
                s.ids.extend(id);

                let joined = body.join(" ");
                if s.slow_command.as_ref().is_some_and(|(cmd, _)| *cmd == joined) {
                    delay = s.slow_command.take().map(|(_, d)| d);
                }

                if devices.contains(&device) {
                    if s.chatter {
                        out.push_str(&format!("#{:02} 0 hello\r\n", device));
                        out.push_str(&format!("!{:02} {} IDLE --\r\n", device, axis));
                    }
                    let (flag, data) = match body {
                        [] => ("OK", "0".to_string()),
                        ["get", "pos"] => ("OK", s.position.to_string()),
                        ["home"] => {
                            s.position = 0;
                            ("OK", "0".to_string())
                        }
                        ["stop"] => ("OK", "0".to_string()),
                        ["set", "maxspeed", n] => {
                            s.max_speed = n.parse().unwrap();
                            ("OK", "0".to_string())
                        }
                        ["move", _, _] if s.reject_moves => ("RJ", "BADDATA".to_string()),
                        ["move", "abs", n] => {
                            s.position = n.parse().unwrap();
                            ("OK", "0".to_string())
                        }
                        ["move", "rel", n] => {
                            s.position += n.parse::<i64>().unwrap();
                            ("OK", "0".to_string())
                        }
                        _ => ("RJ", "BADCOMMAND".to_string()),
                    };
                    let echo = id.map(|id| format!(" {:02}", id)).unwrap_or_default();
                    out.push_str(&format!(
                        "@{:02} {}{} {} IDLE -- {}\r\n",
                        device, axis, echo, flag, data
                    ));
                }
            }
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if wr.write_all(out.as_bytes()).await.is_err() {
            break;
        }
    }
}

fn runtime() -> Arc<Runtime> {
    Arc::new(
        Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap(),
    )
}

fn config() -> SerialConfig {
    SerialConfig {
        reply_timeout: Duration::from_millis(200),
        discovery_window: Duration::from_millis(50),
        ..SerialConfig::default()
    }
}

fn connect(
    runtime: &Arc<Runtime>,
    devices: Vec<u8>,
) -> (AsciiConnection<DuplexStream>, Arc<Mutex<FakeState>>) {
    let (near, far) = tokio::io::duplex(4096);
    let state = Arc::new(Mutex::new(FakeState::default()));
    runtime.spawn(serve(far, devices, state.clone()));
    (AsciiConnection::new(near, runtime.clone(), &config()), state)
}

/// Hands out pipe-backed connections to a fresh fake chain per port.
struct PipeTransport {
    runtime: Arc<Runtime>,
    state: Arc<Mutex<FakeState>>,
}

impl Transport for PipeTransport {
    fn open(&self, _port: &str) -> Result<Box<dyn Connection>, DeviceError> {
        let (near, far) = tokio::io::duplex(4096);
        self.runtime.spawn(serve(far, vec![1], self.state.clone()));
        Ok(Box::new(AsciiConnection::new(
            near,
            self.runtime.clone(),
            &config(),
        )))
    }
}

#[test]
fn discovery_lists_every_device_once() {
    let rt = runtime();
    let (conn, state) = connect(&rt, vec![2, 1]);
    assert_eq!(conn.detect_devices().unwrap(), vec![1, 2]);
    assert_eq!(state.lock().unwrap().received, vec!["/".to_string()]);
}

#[test]
fn empty_chain_discovers_nothing() {
    let rt = runtime();
    let (conn, _state) = connect(&rt, vec![]);
    assert!(conn.detect_devices().unwrap().is_empty());
}

#[test]
fn lengths_and_speeds_go_out_in_native_units() {
    let rt = runtime();
    let (conn, state) = connect(&rt, vec![1]);
    conn.set_max_speed(AXIS, 10.0).unwrap();
    conn.move_absolute(AXIS, -5.13).unwrap();
    conn.move_relative(AXIS, 0.047625).unwrap();

    let s = state.lock().unwrap();
    assert_eq!(
        s.received,
        vec![
            "/1 1 set maxspeed 344021".to_string(),
            "/1 1 move abs -107717".to_string(),
            "/1 1 move rel 1000".to_string(),
        ]
    );
    assert_eq!(s.position, -106717);
    assert_eq!(s.max_speed, 344021);
}

#[test]
fn position_reads_back_in_millimetres() {
    let rt = runtime();
    let (conn, state) = connect(&rt, vec![1]);
    state.lock().unwrap().position = 2000;
    let mm = conn.position(AXIS).unwrap();
    assert!((mm - 0.09525).abs() < 1e-9);
    assert!(!conn.is_busy(AXIS).unwrap());
}

#[test]
fn rejected_move_reports_reason() {
    let rt = runtime();
    let (conn, state) = connect(&rt, vec![1]);
    state.lock().unwrap().reject_moves = true;
    match conn.move_absolute(AXIS, 400.0) {
        Err(DeviceError::Rejected { target, reason, .. }) => {
            assert_eq!(target, AXIS);
            assert_eq!(reason, "BADDATA");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[test]
fn info_and_alert_lines_do_not_answer_commands() {
    let rt = runtime();
    let (conn, state) = connect(&rt, vec![1]);
    {
        let mut s = state.lock().unwrap();
        s.chatter = true;
        s.position = 1000;
    }
    let mm = conn.position(AXIS).unwrap();
    assert!((mm - 0.047625).abs() < 1e-9);
}

#[test]
fn silent_device_times_out() {
    let rt = runtime();
    let (conn, _state) = connect(&rt, vec![1]);
    let err = conn.home(AxisAddress::new(9, 1)).unwrap_err();
    assert_eq!(
        err,
        DeviceError::Timeout {
            command: "home".to_string(),
            timeout_ms: 200,
        }
    );
}

#[test]
fn each_command_carries_the_next_message_id() {
    let rt = runtime();
    let (conn, state) = connect(&rt, vec![1]);
    conn.home(AXIS).unwrap();
    conn.position(AXIS).unwrap();
    conn.is_busy(AXIS).unwrap();
    assert_eq!(state.lock().unwrap().ids, vec![0, 1, 2]);
}

#[test]
fn message_ids_wrap_after_99() {
    let rt = runtime();
    let (conn, state) = connect(&rt, vec![1]);
    for _ in 0..101 {
        conn.is_busy(AXIS).unwrap();
    }
    let s = state.lock().unwrap();
    assert_eq!(s.ids[99], 99);
    assert_eq!(s.ids[100], 0);
}

#[test]
fn late_reply_is_not_taken_for_the_next_answer() {
    let rt = runtime();
    let (conn, state) = connect(&rt, vec![1]);
    {
        let mut s = state.lock().unwrap();
        s.position = 2000;
        s.slow_command = Some(("stop".to_string(), Duration::from_millis(300)));
    }
    assert_eq!(
        conn.stop(AXIS),
        Err(DeviceError::Timeout {
            command: "stop".to_string(),
            timeout_ms: 200,
        })
    );

    // the stop reply (data 0) lands while this request is pending
    let mm = conn.position(AXIS).unwrap();
    assert!((mm - 0.09525).abs() < 1e-9, "read {mm} mm");
    conn.move_relative(AXIS, 0.047625).unwrap();
    let mm = conn.position(AXIS).unwrap();
    assert!((mm - 0.1428750).abs() < 1e-9, "read {mm} mm");
}

#[test]
fn closed_connection_refuses_commands() {
    let rt = runtime();
    let (conn, _state) = connect(&rt, vec![1]);
    conn.close().unwrap();
    assert_eq!(conn.home(AXIS), Err(DeviceError::Closed));
}

#[test]
fn session_runs_protocol_over_serial_link() {
    let rt = runtime();
    let state = Arc::new(Mutex::new(FakeState::default()));
    let transport = Arc::new(PipeTransport {
        runtime: rt.clone(),
        state: state.clone(),
    });
    let session = Session::new("Motor 1", transport, Default::default());
    session.connect("PIPE0").unwrap();
    session.home().unwrap();
    session
        .run_protocol(Protocol::new(28.5, 18.0, 5.0, 2))
        .unwrap();

    let outcome = session.wait().unwrap().unwrap();
    assert_eq!(outcome, RunOutcome::Completed { cycles: 2 });

    let s = state.lock().unwrap();
    let moves: Vec<&str> = s
        .received
        .iter()
        .filter(|l| l.contains("move abs"))
        .map(String::as_str)
        .collect();
    assert_eq!(
        moves,
        vec![
            "/1 1 move abs -107717",
            "/1 1 move abs 0",
            "/1 1 move abs -107717",
            "/1 1 move abs 0",
        ]
    );
    assert_eq!(s.received[0], "/");
}

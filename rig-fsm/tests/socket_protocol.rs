// Text protocol against an in-process TCP stub of the FSM server
use byteorder::{ByteOrder, LittleEndian};
use rig_fsm::builder::{StateMatrixBuilder, StateSpec, END_TRIAL};
use rig_fsm::client::socket::{encode_routes, OutputRoute};
use rig_fsm::config::{ControllerSizes, SocketConfig};
use rig_fsm::matrix::WireTable;
use rig_fsm::{ClientError, Event, SocketTextClient, StateMachineClient, StateMatrix};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// What the stub received
#[derive(Debug, Default)]
struct Recorded {
    lines: Vec<String>,
    /// (command line, decoded doubles) for every binary upload
    uploads: Vec<(String, Vec<f64>)>,
}

/// Events served by `GET EVENTS`: (previous state, code, time, next state)
type ServerEvents = Vec<(f64, f64, f64, f64)>;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn upload_len(line: &str) -> usize {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if line.starts_with("SET STATE MATRIX") {
        let rows: usize = fields[3].parse().unwrap();
        let cols: usize = fields[4].parse().unwrap();
        rows * cols
    } else {
        fields.last().unwrap().parse().unwrap()
    }
}

fn serve(stream: TcpStream, recorded: Arc<Mutex<Recorded>>, events: ServerEvents, run_reply: &str) {
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            return;
        }
        let line = line.trim_end().to_string();
        recorded.lock().unwrap().lines.push(line.clone());

        let reply = if line == "VERSION" {
            "stub-fsm 1.0\nOK\n".to_string()
        } else if line.starts_with("SET STATE MATRIX") || line.starts_with("SET STATE TIMERS") || line.starts_with("SET EXTRA") {
            writer.write_all(b"READY\n").unwrap();
            let mut bytes = vec![0u8; upload_len(&line) * 8];
            reader.read_exact(&mut bytes).unwrap();
            let mut values = vec![0.0; bytes.len() / 8];
            LittleEndian::read_f64_into(&bytes, &mut values);
            recorded.lock().unwrap().uploads.push((line.clone(), values));
            "OK\n".to_string()
        } else if line == "GET EVENT COUNTER" {
            format!("{}\nOK\n", events.len())
        } else if line == "GET TIME" {
            "1.25\nOK\n".to_string()
        } else if let Some(range) = line.strip_prefix("GET EVENTS ") {
            let bounds: Vec<usize> = range.split_whitespace().map(|v| v.parse().unwrap()).collect();
            let rows = &events[bounds[0]..=bounds[1]];
            writer.write_all(format!("MATRIX {} 4\n", rows.len()).as_bytes()).unwrap();
            let mut ready = String::new();
            reader.read_line(&mut ready).unwrap();
            assert_eq!(ready.trim_end(), "READY");
            let mut column_major = Vec::new();
            for col in 0..4 {
                for row in rows {
                    column_major.push([row.0, row.1, row.2, row.3][col]);
                }
            }
            let mut bytes = vec![0u8; column_major.len() * 8];
            LittleEndian::write_f64_into(&column_major, &mut bytes);
            writer.write_all(&bytes).unwrap();
            "OK\n".to_string()
        } else if line == "RUN" {
            format!("{}\n", run_reply)
        } else {
            "OK\n".to_string()
        };
        writer.write_all(reply.as_bytes()).unwrap();
    }
}

fn spawn_server(events: ServerEvents, run_reply: &'static str) -> (String, Arc<Mutex<Recorded>>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let recorded = Arc::new(Mutex::new(Recorded::default()));
    let server_recorded = recorded.clone();
    let handle = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        serve(stream, server_recorded, events, run_reply);
    });
    (address, recorded, handle)
}

fn config(address: &str) -> SocketConfig {
    SocketConfig::new(address, ControllerSizes::new(2, 1, 1)).with_reply_timeout(Duration::from_secs(2))
}

fn two_port_matrix() -> StateMatrix {
    let mut builder = StateMatrixBuilder::new(&["L", "R"], &["Valve"]);
    builder.add_extra_timer("deadline", 5.0).unwrap();
    builder
        .add_state(
            StateSpec::new("choose")
                .arm(&["deadline"])
                .on("Lin", "reward")
                .on("Rin", END_TRIAL)
                .on("deadline", END_TRIAL),
        )
        .unwrap();
    builder
        .add_state(StateSpec::new("reward").timer(0.1).outputs_on(&["Valve"]).serial_out(3).on("Tup", END_TRIAL))
        .unwrap();
    builder.build().unwrap()
}

#[test]
fn test_matrix_round_trip() {
    init_logging();
    let events = vec![(1.0, 0.0, 0.5, 2.0), (2.0, 4.0, 0.75, 0.0)];
    let (address, recorded, server) = spawn_server(events, "OK");

    let mut client = SocketTextClient::new(config(&address));
    client.connect().unwrap();
    assert_eq!(client.version(), Some("stub-fsm 1.0"));
    client.initialize().unwrap();

    let matrix = two_port_matrix();
    client.set_state_matrix(&matrix).unwrap();

    {
        let recorded = recorded.lock().unwrap();
        assert!(recorded.lines.contains(&"SET STATE MACHINE 0".to_string()));

        let (line, values) = &recorded.uploads[0];
        let rows = matrix.n_states() + 1;
        let cols = matrix.wire_width();
        let expected_line = format!(
            "SET STATE MATRIX {} {} 2 0 1 1 0 0 0 {} 1",
            rows,
            cols,
            encode_routes(&[OutputRoute::Dout { line: 0 }, OutputRoute::Ext { module: 0 }])
        );
        assert_eq!(line, &expected_line);

        let table = WireTable::from_column_major(rows, cols, values).unwrap();
        let wire = matrix.wire_table();
        for row in 0..matrix.n_states() {
            assert_eq!(table.row(row), wire.row(row));
        }
        // Input routing row: L rising/falling, R rising/falling, then zeros
        assert_eq!(&table.row(rows - 1)[..5], &[1.0, -1.0, 2.0, -2.0, 0.0]);

        let (timer_line, timers) = &recorded.uploads[1];
        assert_eq!(timer_line, &format!("SET STATE TIMERS {}", matrix.n_states()));
        assert_eq!(timers, &matrix.timers());

        let (_, triggers) = &recorded.uploads[3];
        assert_eq!(triggers, &vec![2.0]);
    }

    assert_eq!(client.get_time().unwrap(), 1.25);
    let fetched = client.get_events().unwrap();
    assert_eq!(fetched, vec![Event::new(0.5, 0, 2), Event::new(0.75, 4, 0)]);
    // Already fetched events are never delivered again
    assert!(client.get_events().unwrap().is_empty());
    assert_eq!(client.events_fetched(), 2);

    client.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_ack_mismatch_names_command_and_replies() {
    init_logging();
    let (address, _recorded, server) = spawn_server(Vec::new(), "NOPE");

    let mut client = SocketTextClient::new(config(&address));
    client.connect().unwrap();
    match client.run() {
        Err(ClientError::AckMismatch {
            command,
            expected,
            received,
        }) => {
            assert_eq!(command, "RUN");
            assert_eq!(expected, "OK");
            assert_eq!(received, "NOPE");
        }
        other => panic!("expected an ack mismatch, got {:?}", other),
    }

    // The connection survives a mismatched acknowledgement
    assert_eq!(client.get_time().unwrap(), 1.25);
    client.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_set_state_outputs_reuploads_patched_matrix() {
    init_logging();
    let (address, recorded, server) = spawn_server(Vec::new(), "OK");
    let mut client = SocketTextClient::new(config(&address));
    client.connect().unwrap();

    let matrix = two_port_matrix();
    client.set_state_matrix(&matrix).unwrap();
    let mut outputs = matrix.output_patterns();
    outputs[2].serial_out = Some(9);
    client.set_state_outputs(&outputs).unwrap();

    {
        let recorded = recorded.lock().unwrap();
        let (line, values) = recorded.uploads.last().unwrap();
        assert!(line.starts_with("SET STATE MATRIX"));
        let table = WireTable::from_column_major(matrix.n_states() + 1, matrix.wire_width(), values).unwrap();
        assert_eq!(table.get(2, matrix.wire_width() - 1), 9.0);
    }

    client.close().unwrap();
    server.join().unwrap();
}

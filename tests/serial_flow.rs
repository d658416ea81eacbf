// End-to-end flow through the serial component backed by the simulator:
// commands queued on the handle reach the simulated panel and its replies
// come back through the line buffer.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use ja2mqtt::config::{SimRule, SimSection, SimulatorConfig};
use ja2mqtt::prfstate;
use ja2mqtt::rules::Value;
use ja2mqtt::serial::Serial;
use ja2mqtt::simulator::Simulator;

fn simulator_config() -> SimulatorConfig {
    SimulatorConfig {
        pin: "1234".to_string(),
        response_delay: 0.0,
        sections: vec![
            SimSection {
                code: 1,
                state: "READY".to_string(),
            },
            SimSection {
                code: 2,
                state: "ARMED".to_string(),
            },
        ],
        rules: Vec::new(),
    }
}

async fn next_line(lines: &mut tokio::sync::mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(2), lines.recv())
        .await
        .expect("timed out waiting for a serial line")
        .expect("serial worker closed the line buffer")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panel_replies_flow_through_the_buffer() {
    let simulator = Simulator::new(&simulator_config(), vec![1, 8], 16, Value::Null).unwrap();
    let mut serial = Serial::new(Box::new(simulator.link()), 1);
    let handle = serial.handle();
    let mut lines = serial.take_lines();
    let exit = CancellationToken::new();
    let worker = serial.start(exit.clone());

    handle.write_line("1234 STATE").unwrap();
    assert_eq!(next_line(&mut lines).await, "STATE 1 READY");
    assert_eq!(next_line(&mut lines).await, "STATE 2 ARMED");

    handle.write_line("1234 SET 1").unwrap();
    assert_eq!(next_line(&mut lines).await, "STATE 1 ARMED");

    handle.write_line("9999 UNSET 2").unwrap();
    assert_eq!(next_line(&mut lines).await, "ERROR: 3 NO_ACCESS");

    handle.write_line("PRFSTATE").unwrap();
    let report = next_line(&mut lines).await;
    let hex = report.strip_prefix("PRFSTATE ").expect("a PRFSTATE report");
    assert_eq!(prfstate::decode(hex).unwrap().len(), 16);

    exit.cancel();
    worker.await.unwrap();
    assert!(!handle.is_ready());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn time_rules_inject_periodic_lines() {
    let mut config = simulator_config();
    config.rules = vec![SimRule {
        time_next: serde_yaml::Value::Number(serde_yaml::Number::from(1)),
        write: serde_yaml::Value::String("OK".to_string()),
    }];
    let simulator = Simulator::new(&config, Vec::new(), 16, Value::Null).unwrap();
    let mut serial = Serial::new(Box::new(simulator.link()), 1);
    let mut lines = serial.take_lines();
    let exit = CancellationToken::new();
    let serial_worker = serial.start(exit.clone());
    let simulator_worker = simulator.start(exit.clone());

    let line = tokio::time::timeout(Duration::from_secs(5), lines.recv())
        .await
        .expect("timed out waiting for the injected line")
        .expect("serial worker closed the line buffer");
    assert_eq!(line, "OK");

    exit.cancel();
    serial_worker.await.unwrap();
    simulator_worker.await.unwrap();
}

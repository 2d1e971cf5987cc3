mod common;

use common::{block, MockConnector, MockScope, RTM_IDN, RTO_IDN};
use rohdescope::domain::model::{RawTrace, TriggerCoupling, TriggerSlope, TriggerSource};
use rohdescope::{ConnectionSettings, ScopeConnection, ScopeError, ScopeModel};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

async fn connected(model: ScopeModel, scope: &MockScope) -> ScopeConnection<MockConnector> {
    let connection = ScopeConnection::new(model, scope.connector(), ConnectionSettings::default());
    connection.connect().await.unwrap();
    scope.clear_writes();
    connection
}

#[tokio::test]
async fn test_connect_configures_rto() {
    let scope = MockScope::new(RTO_IDN);
    let connection =
        ScopeConnection::new(ScopeModel::Rto, scope.connector(), ConnectionSettings::default());

    connection.connect().await.unwrap();

    assert_eq!(
        scope.writes(),
        vec![
            "*IDN?",
            "*CLS",
            "EXPort:WAVeform:INCXvalues OFF",
            "EXPort:WAVeform:MULTichannel ON",
            "EXP:WAV:FAST ON",
            "FORMAT:DATA INT,8",
        ]
    );
    assert!(connection.connected().await);
    assert_eq!(connection.firmware_version().await.unwrap().to_string(), "2.15.2.0");

    // 已連線時不重新設定
    scope.clear_writes();
    connection.connect().await.unwrap();
    assert!(scope.writes().is_empty());
    assert_eq!(scope.opened(), 1);
}

#[tokio::test]
async fn test_auto_detect_keeps_the_link() {
    let scope = MockScope::new(RTM_IDN);
    let connection = ScopeConnection::auto_detect(scope.connector(), ConnectionSettings::default())
        .await
        .unwrap();
    assert_eq!(connection.model(), ScopeModel::Rtm);
    assert!(!connection.connected().await);

    connection.connect().await.unwrap();
    assert_eq!(scope.opened(), 1);
    assert_eq!(scope.writes(), vec!["*IDN?", "*IDN?", "*CLS"]);
    assert_eq!(connection.identity().await.unwrap().model, "RTM2054");
}

#[tokio::test]
async fn test_auto_detect_falls_back_to_generic() {
    let scope = MockScope::new("KEYSIGHT,DSOX1204G,CN1234,2.12.2019");
    let connection = ScopeConnection::auto_detect(scope.connector(), ConnectionSettings::default())
        .await
        .unwrap();
    assert_eq!(connection.model(), ScopeModel::Generic);
}

#[tokio::test]
async fn test_malformed_identifier_fails_to_connect() {
    let scope = MockScope::new("garbage");
    let connection =
        ScopeConnection::new(ScopeModel::Rtm, scope.connector(), ConnectionSettings::default());

    let err = assert_err!(connection.connect().await);
    assert!(matches!(err, ScopeError::UnexpectedResponse { .. }));
    assert!(!connection.connected().await);
}

#[tokio::test]
async fn test_operations_require_a_connection() {
    let scope = MockScope::new(RTM_IDN);
    let connection =
        ScopeConnection::new(ScopeModel::Rtm, scope.connector(), ConnectionSettings::default());

    assert!(matches!(
        connection.get_identifier().await,
        Err(ScopeError::NotConnected)
    ));
    assert!(matches!(
        connection.get_firmware_version().await,
        Err(ScopeError::NotInstantiated)
    ));
    assert!(scope.writes().is_empty());
}

#[tokio::test]
async fn test_disconnect_closes_once() {
    let scope = MockScope::new(RTM_IDN);
    let connection = connected(ScopeModel::Rtm, &scope).await;

    connection.disconnect().await.unwrap();
    connection.disconnect().await.unwrap();

    assert_eq!(scope.closed(), 1);
    assert!(!connection.connected().await);
    assert!(connection.firmware_version().await.is_none());
}

#[tokio::test]
async fn test_issue_command() {
    let scope = MockScope::new(RTM_IDN);
    scope.answer("TIMebase:SCALe?", "1.0E-3");
    let connection = connected(ScopeModel::Rtm, &scope).await;

    assert_eq!(connection.issue_command("TIMebase:SCALe?").await.unwrap(), "1.0E-3");
    assert_eq!(
        connection.issue_command(" TIMebase:SCALe 2e-3 ").await.unwrap(),
        "Write command OK."
    );
    assert_eq!(scope.writes(), vec!["TIMebase:SCALe?", "TIMebase:SCALe 2e-3"]);
}

#[tokio::test]
async fn test_status_and_state() {
    let scope = MockScope::new(RTM_IDN);
    scope
        .answer("STATus:OPER:COND?", "24")
        .answer("CHAN:HIST:CURR?", "1");
    let rtm = connected(ScopeModel::Rtm, &scope).await;

    assert_eq!(rtm.get_status().await.unwrap(), "Waiting for trigger.");
    assert!(rtm.get_state().await.unwrap());

    let scope = MockScope::new(RTO_IDN);
    scope.answer("STATus:OPER:COND?", "48");
    let rto = connected(ScopeModel::Rto, &scope).await;
    assert_eq!(rto.get_status().await.unwrap(), "Measuring.");
    assert!(matches!(
        rto.get_state().await,
        Err(ScopeError::Unsupported { .. })
    ));

    let scope = MockScope::new("ACME,SCOPE1,1,1.0");
    let generic = connected(ScopeModel::Generic, &scope).await;
    assert!(matches!(
        generic.get_status().await,
        Err(ScopeError::Unsupported { .. })
    ));
}

#[tokio::test]
async fn test_rto_time_position_is_shifted_to_center() {
    let scope = MockScope::new(RTO_IDN);
    scope
        .answer("TIMebase:HORizontal:POSition?", "0.001")
        .answer("TIMebase:REFerence?", "10")
        .answer("TIMebase:RANGe?", "0.01");
    let connection = connected(ScopeModel::Rto, &scope).await;

    let position = connection.get_time_position().await.unwrap();
    assert!((position - 0.005).abs() < 1e-12);

    connection.set_time_position(0.002).await.unwrap();
    assert_eq!(
        &scope.writes()[3..],
        &["TIMebase:REFerence 50", "TIMebase:HORizontal:POSition 0.002"]
    );
}

#[tokio::test]
async fn test_channel_accessors() {
    let scope = MockScope::new(RTO_IDN);
    scope
        .answer("CHAN2:STATe?", "1")
        .answer("CHAN2:RANGe?", "0.8")
        .answer("CHAN2:COUPLing?", "DCL");
    let connection = connected(ScopeModel::Rto, &scope).await;

    assert!(connection.get_channel_enabled(2).await.unwrap());
    assert_eq!(connection.get_channel_range(2).await.unwrap(), 0.8);
    assert_eq!(
        connection.get_channel_coupling(2).await.unwrap().mnemonic(),
        "DCL"
    );
    connection.set_channel_enabled(3, false).await.unwrap();

    assert_eq!(
        scope.writes(),
        vec![
            "CHAN2:STATe?",
            "CHANnel2:EXPortstate ON",
            "CHAN2:RANGe?",
            "CHAN2:COUPLing?",
            "CHAN3:STATe OFF",
        ]
    );
}

#[tokio::test]
async fn test_trigger_dialects() {
    let scope = MockScope::new(RTM_IDN);
    scope.answer("TRIG:A:SOUR?", "EXT");
    let rtm = connected(ScopeModel::Rtm, &scope).await;

    assert_eq!(rtm.get_trigger_source().await.unwrap(), TriggerSource::External);
    rtm.set_trigger_source(TriggerSource::Channel(2)).await.unwrap();
    rtm.set_trigger_slope(TriggerSlope::Either).await.unwrap();
    rtm.set_trigger_coupling(TriggerCoupling::Hf).await.unwrap();
    assert!(matches!(
        rtm.set_trigger_coupling(TriggerCoupling::DcLimit).await,
        Err(ScopeError::Unsupported { .. })
    ));
    assert_eq!(
        &scope.writes()[1..],
        &["TRIG:A:SOUR CH2", "TRIG:A:EDGE:SLOPE EITH", "TRIG:A:EDGE:COUPLing HF"]
    );

    let scope = MockScope::new(RTO_IDN);
    scope.answer("TRIG:ANEDge:COUPLing?", "AC");
    let rto = connected(ScopeModel::Rto, &scope).await;
    assert_eq!(rto.get_trigger_coupling().await.unwrap(), TriggerCoupling::Ac);
    rto.set_trigger_level(1, 0.25).await.unwrap();
    assert_eq!(scope.writes()[1], "TRIG:LEV1 0.25");
}

#[tokio::test]
async fn test_model_specific_operations() {
    let scope = MockScope::new(RTM_IDN);
    let rtm = connected(ScopeModel::Rtm, &scope).await;
    assert!(matches!(
        rtm.set_record_length(10_000).await,
        Err(ScopeError::Unsupported { .. })
    ));
    assert!(rtm.set_fast_readout(true).await.is_err());
    assert!(rtm.set_display(false).await.is_err());
    assert!(scope.writes().is_empty());

    let scope = MockScope::new(RTO_IDN);
    let rto = connected(ScopeModel::Rto, &scope).await;
    rto.set_record_length(10_000).await.unwrap();
    rto.set_display(false).await.unwrap();
    assert_eq!(
        scope.writes(),
        vec!["ACQuire:POINts:AUTO RECL", "ACQuire:POINts 10000", "EXP:WAV:DISP 1"]
    );
}

#[tokio::test]
async fn test_busy_wait_polls_event_status() {
    let scope = MockScope::new(RTO_IDN);
    scope
        .answer("*ESR?", "0")
        .answer("*ESR?", "0")
        .answer("*ESR?", "1");
    let connection = connected(ScopeModel::Rto, &scope).await;

    connection.wait(true).await.unwrap();

    assert_eq!(scope.writes()[0], "*OPC");
    assert_eq!(scope.count("*ESR?"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_busy_wait_times_out() {
    let scope = MockScope::new(RTO_IDN);
    scope.answer("*ESR?", "0");
    let settings = ConnectionSettings {
        io_timeout: Duration::from_millis(50),
        poll_interval: Duration::from_millis(10),
    };
    let connection = ScopeConnection::new(ScopeModel::Rto, scope.connector(), settings);
    connection.connect().await.unwrap();

    let err = connection.wait(true).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(scope.count("*ESR?") > 1);
}

#[tokio::test]
async fn test_blocking_wait() {
    let scope = MockScope::new(RTO_IDN);
    scope.answer("RUNS;*OPC?", "1");
    let connection = connected(ScopeModel::Rto, &scope).await;

    assert_ok!(connection.wait(false).await);
    assert_eq!(scope.writes(), vec!["RUNS;*OPC?"]);
}

#[tokio::test]
async fn test_rto_single_acquisition() {
    let scope = MockScope::new(RTO_IDN);
    scope
        .answer("*ESR?", "1")
        .answer_bytes("CHAN1:WAV1:DATA:VAL?", block(&[1, 2, 3, 4, 0xff, 0x80]));
    let connection = connected(ScopeModel::Rto, &scope).await;

    let before = chrono::Utc::now();
    let stamp = connection
        .stamp_acquisition([1u8, 2], None, true)
        .await
        .unwrap();
    assert!(stamp.timestamp >= before);
    assert_eq!(
        scope.writes(),
        vec!["RUNS", "*OPC", "*ESR?", "CHAN1:WAV1:DATA:VAL?"]
    );

    let data = connection
        .parse_waveform_string([1u8, 2], &stamp.raw)
        .unwrap();
    assert_eq!(data[&1], RawTrace::I8(vec![1, 3, -1]));
    assert_eq!(data[&2], RawTrace::I8(vec![2, 4, -128]));
}

#[tokio::test]
async fn test_empty_selection_reads_nothing() {
    let scope = MockScope::new(RTO_IDN);
    let connection = connected(ScopeModel::Rto, &scope).await;

    let stamp = connection
        .stamp_acquisition(Vec::<u8>::new(), Some(true), true)
        .await
        .unwrap();
    assert!(stamp.raw.is_empty());
    assert!(scope.writes().is_empty());
}

#[tokio::test]
async fn test_rtm_waveforms_in_volts() {
    let scope = MockScope::new(RTM_IDN);
    scope
        .answer_bytes("CHAN1:DATA?", block(&[0, 255]))
        .answer_bytes("CHAN3:DATA?", block(&[255]));
    let connection = connected(ScopeModel::Rtm, &scope).await;

    // RTM 預設連續擷取
    let mut enabled = BTreeMap::new();
    enabled.insert(3u8, true);
    enabled.insert(2u8, false);
    enabled.insert(1u8, true);

    let scales = BTreeMap::from([(1u8, 0.5), (3u8, 1.0)]);
    let positions = BTreeMap::from([(1u8, 1.0), (3u8, 0.0)]);
    let waveforms = connection
        .get_waveforms(enabled, Some(&scales), Some(&positions))
        .await
        .unwrap();

    assert_eq!(scope.writes(), vec!["CHAN1:DATA?", "CHAN3:DATA?"]);
    assert_eq!(waveforms[&1], vec![-3.0, 2.0]);
    assert_eq!(waveforms[&3], vec![5.0]);
}

#[tokio::test]
async fn test_generic_model_cannot_read_waveforms() {
    let scope = MockScope::new("ACME,SCOPE1,1,1.0");
    let connection = connected(ScopeModel::Generic, &scope).await;

    assert!(matches!(
        connection.get_waveform_data([1u8]).await,
        Err(ScopeError::Unsupported { .. })
    ));
}

#[tokio::test]
async fn test_device_clear_drops_unread_output() {
    let scope = MockScope::new(RTM_IDN);
    let connection = connected(ScopeModel::Rtm, &scope).await;

    connection.write("*IDN?").await.unwrap();
    connection.device_clear().await.unwrap();

    assert_eq!(scope.device_clears(), 1);
    let err = assert_err!(connection.ask("*OPC?").await);
    assert!(err.is_timeout());
}

#[tokio::test]
async fn test_failed_release_keeps_the_outcome() {
    let scope = MockScope::new(RTM_IDN);
    scope.fail_close();
    let connection = connected(ScopeModel::Rtm, &scope).await;

    let answer = connection.get_identifier().await;
    let answer = assert_ok!(connection.disconnect_after(answer).await);
    assert_eq!(answer, RTM_IDN);
    assert!(!connection.connected().await);

    let scope = MockScope::new(RTO_IDN);
    scope.fail_close();
    let connection = connected(ScopeModel::Rto, &scope).await;

    let outcome = connection.get_state().await;
    let err = assert_err!(connection.disconnect_after(outcome).await);
    assert!(matches!(err, ScopeError::Unsupported { .. }));
    assert_eq!(scope.closed(), 1);
}

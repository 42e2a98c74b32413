//! Tests for the detection engine, driven through dummies.

use smb1351_chgdet_traits::Line;

use super::{ClassifierState, DeferredTask, DetectionEngine};
use crate::config::DetectionConfig;
use crate::detection::policy_manager::{Event, SupplyType};
use crate::dummy::{DummyLines, DummyManager, DummyTimer, DummyTransport};
use crate::regs::{
    CMD_APSD_RE_RUN_BIT, CMD_INCREMENT_QC3_BIT, CMD_OTG_EN_BIT, HVDCP_EN_BIT, Reg,
};
use crate::{Error, HvdcpState, NegotiationStatus, PortType};

type TestEngine = DetectionEngine<DummyTransport, DummyLines, DummyTimer, DummyManager>;

/// APSD-complete latched and asserted in IRQ_G.
const IRQ_G_APSD_COMPLETE: u8 = 0xC0;

fn get_engine() -> TestEngine {
    DetectionEngine::new(
        DummyTransport::new(),
        DummyLines::default(),
        DummyManager::new(),
        DetectionConfig::default(),
    )
}

/// An engine with detection enabled and the setup writes cleared away.
async fn get_enabled_engine() -> TestEngine {
    let mut engine = get_engine();
    engine.enable_detection(true).await.unwrap();
    engine.regs.transport_mut().clear_writes();
    engine
}

/// Latches a classification result and delivers the completion interrupt.
async fn classify_port(engine: &mut TestEngine, status_5: u8) {
    let transport = engine.regs.transport_mut();
    transport.set_reg(Reg::STATUS_5, status_5);
    transport.set_reg(Reg::IRQ_G, IRQ_G_APSD_COMPLETE);
    transport.inject_interrupt();
    engine.run_step().await.unwrap();
}

fn apsd_rerun_count(engine: &mut TestEngine) -> usize {
    engine
        .regs
        .transport_mut()
        .writes_to(Reg::CMD_HVDCP)
        .filter(|value| value & CMD_APSD_RE_RUN_BIT != 0)
        .count()
}

#[tokio::test]
async fn cdp_attach_classifies_without_negotiation() {
    let mut engine = get_enabled_engine().await;

    classify_port(&mut engine, 0x80).await;

    let state = engine.state();
    assert_eq!(state.port_type, PortType::ChargingDownstream);
    assert_eq!(state.classifier, ClassifierState::Resolved);
    assert_eq!(state.hvdcp, HvdcpState::NotDetected);
    assert_eq!(state.negotiation, NegotiationStatus::Idle);
    assert_eq!(state.rerun_count(), 0);
    assert_eq!(apsd_rerun_count(&mut engine), 0);

    let notifications = engine.manager.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, SupplyType::Cdp);
    assert!(notifications[0].online);

    // D+/D- handed back to the host.
    assert_eq!(engine.lines.level(Line::UsbSwitch), Some(true));
}

#[tokio::test]
async fn empty_apsd_result_exhausts_reruns() {
    let mut engine = get_enabled_engine().await;

    classify_port(&mut engine, 0x00).await;

    let state = engine.state();
    assert_eq!(state.port_type, PortType::Unknown);
    assert_eq!(state.classifier, ClassifierState::Idle);
    assert_eq!(state.hvdcp, HvdcpState::NotDetected);
    assert_eq!(state.negotiation, NegotiationStatus::Idle);
    assert_eq!(state.rerun_count(), 3);
    assert_eq!(apsd_rerun_count(&mut engine), 3);

    // An unresolved port is never reported as a supply.
    assert!(engine.manager.notifications().is_empty());
}

#[tokio::test]
async fn aca_pattern_classifies_as_non_standard() {
    let mut engine = get_enabled_engine().await;

    classify_port(&mut engine, 0x03).await;

    assert_eq!(engine.state().port_type, PortType::NonStandard);
    assert_eq!(
        engine.manager.notifications().last().unwrap().kind,
        SupplyType::NonStandard
    );
}

#[tokio::test]
async fn qc3_adapter_negotiates_with_bounded_pulses() {
    let mut engine = get_enabled_engine().await;
    classify_port(&mut engine, 0x40).await;

    assert_eq!(engine.state().port_type, PortType::DedicatedCharger);
    assert_eq!(
        engine.manager.notifications().last().unwrap().kind,
        SupplyType::Dcp
    );
    assert!(engine.deferred.deadline(DeferredTask::HvdcpDetect).is_some());

    // The adapter signals continuous mode; the probe fires next step.
    engine.regs.transport_mut().set_reg(Reg::IRQ_H, 0x10);
    engine.run_step().await.unwrap();

    let state = engine.state();
    assert_eq!(state.hvdcp, HvdcpState::Qc3);
    assert_eq!(state.negotiation, NegotiationStatus::Complete);
    assert!(state.dpdm_negotiated);

    // 7 V from 5 V in 200 mV steps wants 10 pulses; the bound caps it at 8.
    let pulses = engine
        .regs
        .transport_mut()
        .writes_to(Reg::CMD_HVDCP)
        .filter(|value| value & CMD_INCREMENT_QC3_BIT != 0)
        .count();
    assert_eq!(pulses, 8);

    let hvdcp3_notifications = engine
        .manager
        .notifications()
        .iter()
        .filter(|change| change.kind == SupplyType::Hvdcp3)
        .count();
    assert_eq!(hvdcp3_notifications, 1);

    assert!(engine.deferred.deadline(DeferredTask::HvdcpModeCheck).is_some());
}

#[tokio::test]
async fn qc2_adapter_selects_9v() {
    let mut engine = get_enabled_engine().await;
    classify_port(&mut engine, 0x40).await;

    engine.regs.transport_mut().set_reg(Reg::STATUS_7, 0x04);
    engine.run_step().await.unwrap();

    let state = engine.state();
    assert_eq!(state.hvdcp, HvdcpState::Qc2);
    assert_eq!(state.negotiation, NegotiationStatus::Complete);
    assert!(state.dpdm_negotiated);

    // 9 V tier requested from the adapter-select field.
    assert_eq!(engine.regs.transport_mut().reg(Reg::HVDCP_CTRL) & 0xC0, 0x40);
    assert_eq!(
        engine.manager.notifications().last().unwrap().kind,
        SupplyType::Hvdcp
    );
}

#[tokio::test]
async fn hvdcp_probe_times_out_and_reverts() {
    let mut engine = get_enabled_engine().await;
    classify_port(&mut engine, 0x40).await;
    engine.regs.transport_mut().clear_writes();

    // Three fruitless probes, then the bounded retry gives up.
    for attempt in 1..=3 {
        engine.run_step().await.unwrap();
        assert_eq!(engine.state().probe_count(), attempt);
        assert_eq!(engine.state().negotiation, NegotiationStatus::Probing);
        assert!(engine.deferred.deadline(DeferredTask::HvdcpDetect).is_some());
    }

    engine.run_step().await.unwrap();

    let state = engine.state();
    assert_eq!(state.negotiation, NegotiationStatus::TimedOut);
    assert_eq!(state.hvdcp, HvdcpState::NotDetected);
    assert!(engine.deferred.deadline(DeferredTask::HvdcpDetect).is_none());

    // Hardware detection off, classification restarted at 5 V.
    assert_eq!(
        engine.regs.transport_mut().reg(Reg::HVDCP_CTRL) & HVDCP_EN_BIT,
        0
    );
    assert_eq!(apsd_rerun_count(&mut engine), 1);
}

#[tokio::test]
async fn probe_deferred_while_bus_is_down() {
    let mut engine = get_enabled_engine().await;
    classify_port(&mut engine, 0x40).await;

    engine.manager.vbus_mv = 0;
    engine.run_step().await.unwrap();

    // No retry was spent; the probe just re-armed itself.
    assert_eq!(engine.state().probe_count(), 0);
    assert_eq!(engine.state().hvdcp, HvdcpState::NotDetected);
    assert!(engine.deferred.deadline(DeferredTask::HvdcpDetect).is_some());

    // Once the bus is up, detection proceeds.
    engine.manager.vbus_mv = 9000;
    engine.regs.transport_mut().set_reg(Reg::STATUS_7, 0x04);
    engine.run_step().await.unwrap();
    assert_eq!(engine.state().hvdcp, HvdcpState::Qc2);
}

#[tokio::test]
async fn sagging_contract_gets_bounded_aicl_restarts() {
    let mut engine = get_enabled_engine().await;
    classify_port(&mut engine, 0x40).await;
    engine.regs.transport_mut().set_reg(Reg::STATUS_7, 0x04);
    engine.run_step().await.unwrap();
    engine.regs.transport_mut().clear_writes();

    // The input reports USB 500 mA mode from now on.
    engine.regs.transport_mut().set_reg(Reg::STATUS_0, 0x40);

    for retry in 1..=3 {
        engine.run_step().await.unwrap();
        assert_eq!(engine.state().aicl_retry_count(), retry);
        assert_eq!(engine.state().hvdcp, HvdcpState::Qc2);
    }

    // Each restart bounces the input mode through USB 500 and back to AC.
    let input_modes: Vec<u8> = engine
        .regs
        .transport_mut()
        .writes_to(Reg::CMD_INPUT_LIMIT)
        .collect();
    assert_eq!(input_modes, [0x00, 0x01, 0x00, 0x01, 0x00, 0x01]);

    // The fourth check abandons the contract.
    engine.run_step().await.unwrap();

    let state = engine.state();
    assert_eq!(state.hvdcp, HvdcpState::NotDetected);
    assert!(!state.dpdm_negotiated);
    assert_eq!(state.negotiation, NegotiationStatus::Idle);
    assert!(engine.deferred.deadline(DeferredTask::HvdcpModeCheck).is_none());
    assert_eq!(apsd_rerun_count(&mut engine), 1);
}

#[tokio::test]
async fn healthy_contract_keeps_its_supervision() {
    let mut engine = get_enabled_engine().await;
    classify_port(&mut engine, 0x40).await;
    engine.regs.transport_mut().set_reg(Reg::STATUS_7, 0x04);
    engine.run_step().await.unwrap();

    // Input stays in AC mode; supervision just re-arms.
    engine.run_step().await.unwrap();

    assert_eq!(engine.state().hvdcp, HvdcpState::Qc2);
    assert_eq!(engine.state().aicl_retry_count(), 0);
    assert!(engine.deferred.deadline(DeferredTask::HvdcpModeCheck).is_some());
}

#[tokio::test]
async fn undervoltage_bounce_collapses_the_contract() {
    let mut engine = get_enabled_engine().await;
    classify_port(&mut engine, 0x40).await;
    engine.regs.transport_mut().set_reg(Reg::STATUS_7, 0x04);
    engine.run_step().await.unwrap();
    assert_eq!(engine.state().hvdcp, HvdcpState::Qc2);
    engine.regs.transport_mut().clear_writes();

    // Undervoltage asserts, then clears within the collapse window.
    engine.regs.transport_mut().set_reg(Reg::IRQ_E, 0x30);
    engine.regs.transport_mut().inject_interrupt();
    engine.run_step().await.unwrap();

    engine.regs.transport_mut().set_reg(Reg::IRQ_E, 0x20);
    engine.regs.transport_mut().inject_interrupt();
    engine.run_step().await.unwrap();

    let state = engine.state();
    assert_eq!(state.hvdcp, HvdcpState::NotDetected);
    assert!(!state.dpdm_negotiated);
    // The glitch restarted classification; the charger is still a DCP.
    assert_eq!(state.port_type, PortType::DedicatedCharger);
    assert_eq!(
        engine.regs.transport_mut().reg(Reg::HVDCP_CTRL) & HVDCP_EN_BIT,
        0
    );
    assert!(apsd_rerun_count(&mut engine) >= 1);
    assert_eq!(
        engine.manager.notifications().last().unwrap().kind,
        SupplyType::Dcp
    );
}

#[tokio::test]
async fn short_aicl_grant_restarts_aicl() {
    let mut engine = get_enabled_engine().await;
    // No probing on this port, so supervision is the next deferred work.
    engine.hv_allowed = false;
    classify_port(&mut engine, 0x40).await;
    assert!(engine.deferred.deadline(DeferredTask::HvdcpDetect).is_none());

    // AICL granted less than the configured input limit.
    engine.regs.transport_mut().set_reg(Reg::CHG_CURRENT_CTRL, 0x05);
    engine.regs.transport_mut().set_reg(Reg::STATUS_0, 0x82);
    engine.regs.transport_mut().clear_writes();

    engine.run_step().await.unwrap();

    let input_modes: Vec<u8> = engine
        .regs
        .transport_mut()
        .writes_to(Reg::CMD_INPUT_LIMIT)
        .collect();
    assert_eq!(input_modes, [0x00, 0x01]);
    assert!(engine.deferred.deadline(DeferredTask::AiclSupervise).is_some());

    // A matching grant leaves the input mode alone.
    engine.regs.transport_mut().set_reg(Reg::STATUS_0, 0x85);
    engine.regs.transport_mut().clear_writes();
    engine.run_step().await.unwrap();

    assert!(engine.regs.transport_mut().writes().is_empty());
}

#[tokio::test]
async fn silent_sdp_becomes_float() {
    let mut engine = get_enabled_engine().await;
    classify_port(&mut engine, 0x10).await;

    assert_eq!(engine.state().port_type, PortType::StandardDownstream);
    assert!(engine.deferred.deadline(DeferredTask::FloatCheck).is_some());
    engine.regs.transport_mut().clear_writes();

    engine.manager.enumerated = false;
    engine.run_step().await.unwrap();

    assert_eq!(engine.state().port_type, PortType::Float);
    assert_eq!(apsd_rerun_count(&mut engine), 1);
    assert_eq!(
        engine.manager.notifications().last().unwrap().kind,
        SupplyType::Float
    );
}

#[tokio::test]
async fn enumerated_sdp_stays_sdp() {
    let mut engine = get_enabled_engine().await;
    classify_port(&mut engine, 0x10).await;
    engine.regs.transport_mut().clear_writes();

    engine.manager.enumerated = true;
    engine.run_step().await.unwrap();

    assert_eq!(engine.state().port_type, PortType::StandardDownstream);
    assert_eq!(apsd_rerun_count(&mut engine), 0);
}

#[tokio::test]
async fn otg_suppresses_detection() {
    let mut engine = get_engine();
    engine.enable_otg(true).await.unwrap();

    assert_eq!(
        engine.regs.transport_mut().reg(Reg::CMD_CHG) & CMD_OTG_EN_BIT,
        CMD_OTG_EN_BIT
    );

    // A classification interrupt arrives while sourcing power.
    let before = engine.state();
    engine.regs.transport_mut().set_reg(Reg::STATUS_5, 0x80);
    engine.regs.transport_mut().set_reg(Reg::IRQ_G, IRQ_G_APSD_COMPLETE);
    engine.regs.transport_mut().inject_interrupt();
    engine.run_step().await.unwrap();

    assert_eq!(engine.state(), before);
    assert!(engine.manager.notifications().is_empty());

    // Detection cannot be enabled while sourcing.
    assert!(matches!(
        engine.enable_detection(true).await,
        Err(Error::InvariantViolation)
    ));
}

#[tokio::test]
async fn enable_detection_is_idempotent() {
    let mut engine = get_enabled_engine().await;

    engine.enable_detection(true).await.unwrap();

    assert!(engine.regs.transport_mut().writes().is_empty());
    assert_eq!(apsd_rerun_count(&mut engine), 0);
}

#[tokio::test]
async fn plug_out_cancels_pending_work() {
    let mut engine = get_enabled_engine().await;
    classify_port(&mut engine, 0x40).await;
    assert!(engine.deferred.deadline(DeferredTask::HvdcpDetect).is_some());

    engine.plug_out().unwrap();

    let state = engine.state();
    assert!(!state.attached);
    assert_eq!(state.port_type, PortType::Unknown);
    assert_eq!(state.hvdcp, HvdcpState::NotDetected);
    assert!(engine.deferred.deadline(DeferredTask::HvdcpDetect).is_none());
    assert!(engine.deferred.deadline(DeferredTask::AiclSupervise).is_none());
    assert!(engine.deferred.deadline(DeferredTask::HvdcpRearm).is_some());

    // The rearm re-enables hardware detection once the source is gone, and
    // touches nothing else.
    engine.manager.vbus_mv = 0;
    let before = engine.state();
    engine.run_step().await.unwrap();

    assert_eq!(engine.state(), before);
    assert_eq!(
        engine.regs.transport_mut().reg(Reg::HVDCP_CTRL) & HVDCP_EN_BIT,
        HVDCP_EN_BIT
    );
}

#[tokio::test]
async fn policy_events_drive_the_facade() {
    let mut engine = get_engine();

    engine.manager.push_event(Event::EnableDetection(true));
    engine.run_step().await.unwrap();
    assert!(engine.state().detection_enabled);

    engine.manager.push_event(Event::PlugOut);
    engine.run_step().await.unwrap();
    assert!(!engine.state().attached);
}

#[tokio::test]
async fn rejected_policy_event_is_dropped() {
    let mut engine = get_engine();
    engine.enable_otg(true).await.unwrap();

    engine.manager.push_event(Event::EnableDetection(true));
    engine.run_step().await.unwrap();

    assert!(!engine.state().detection_enabled);
}

#[tokio::test]
async fn thermal_policy_tears_down_the_contract() {
    let mut engine = get_enabled_engine().await;
    classify_port(&mut engine, 0x40).await;
    engine.regs.transport_mut().set_reg(Reg::STATUS_7, 0x04);
    engine.run_step().await.unwrap();
    assert_eq!(engine.state().hvdcp, HvdcpState::Qc2);
    engine.regs.transport_mut().clear_writes();

    engine.manager.hv_allowed = false;
    engine.check_high_voltage_policy().await.unwrap();

    let state = engine.state();
    assert_eq!(state.hvdcp, HvdcpState::NotDetected);
    assert!(!state.dpdm_negotiated);
    assert_eq!(
        engine.regs.transport_mut().reg(Reg::HVDCP_CTRL) & HVDCP_EN_BIT,
        0
    );
    assert_eq!(apsd_rerun_count(&mut engine), 1);
    assert!(engine.deferred.deadline(DeferredTask::HvdcpModeCheck).is_none());

    // Policy flips back; the probe starts over on the dedicated charger.
    engine.manager.hv_allowed = true;
    engine.check_high_voltage_policy().await.unwrap();
    assert!(engine.deferred.deadline(DeferredTask::HvdcpDetect).is_some());
}

#[tokio::test]
async fn policy_withdrawal_cancels_pending_probe() {
    let mut engine = get_enabled_engine().await;
    classify_port(&mut engine, 0x40).await;
    assert!(engine.deferred.deadline(DeferredTask::HvdcpDetect).is_some());

    // Permission is withdrawn before the probe window elapses.
    engine.manager.hv_allowed = false;
    engine.check_high_voltage_policy().await.unwrap();
    assert!(engine.deferred.deadline(DeferredTask::HvdcpDetect).is_none());

    // Even a probe that was already due stays inert once the policy flipped.
    engine.deferred.set(DeferredTask::HvdcpDetect, 0);
    engine.regs.transport_mut().set_reg(Reg::STATUS_7, 0x04);
    engine.regs.transport_mut().clear_writes();
    engine.run_step().await.unwrap();

    let state = engine.state();
    assert_eq!(state.hvdcp, HvdcpState::NotDetected);
    assert_eq!(state.negotiation, NegotiationStatus::Idle);
    assert!(engine.regs.transport_mut().writes_to(Reg::HVDCP_CTRL).next().is_none());
}

#[tokio::test]
async fn failed_irq_read_preserves_the_edge() {
    let mut engine = get_enabled_engine().await;
    let transport = engine.regs.transport_mut();
    transport.set_reg(Reg::STATUS_5, 0x80);
    // Status-only change, no latch: only edge detection can see it.
    transport.set_reg(Reg::IRQ_G, 0x40);
    transport.fail_next_read(Reg::IRQ_G);

    transport.inject_interrupt();
    engine.run_step().await.unwrap();
    assert_eq!(engine.state().port_type, PortType::Unknown);

    // The stored previous value was not touched by the failed read, so the
    // retried scan still sees the rising edge.
    engine.regs.transport_mut().inject_interrupt();
    engine.run_step().await.unwrap();
    assert_eq!(engine.state().port_type, PortType::ChargingDownstream);
}

#[tokio::test]
async fn battery_flags_track_their_interrupts() {
    let mut engine = get_enabled_engine().await;
    let transport = engine.regs.transport_mut();
    // Hard hot limit latched and asserted, battery missing asserted.
    transport.set_reg(Reg::IRQ_A, 0xC0);
    transport.set_reg(Reg::IRQ_B, 0x30);
    transport.inject_interrupt();

    engine.run_step().await.unwrap();

    assert!(engine.state().battery.hot);
    assert!(engine.state().battery.missing);

    // Both clear again.
    let transport = engine.regs.transport_mut();
    transport.set_reg(Reg::IRQ_A, 0x00);
    transport.set_reg(Reg::IRQ_B, 0x00);
    transport.inject_interrupt();
    engine.run_step().await.unwrap();

    assert!(!engine.state().battery.hot);
    assert!(!engine.state().battery.missing);
}

#[tokio::test]
async fn wake_brackets_stay_balanced() {
    let mut engine = get_enabled_engine().await;
    classify_port(&mut engine, 0x40).await;
    engine.regs.transport_mut().set_reg(Reg::IRQ_H, 0x10);
    engine.run_step().await.unwrap();
    engine.plug_out().unwrap();

    assert_eq!(engine.regs.transport_mut().wake_balance(), 0);
}

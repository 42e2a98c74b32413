//! The detection engine: classification, HVDCP negotiation, and contract
//! supervision.
//!
//! The engine owns the chip exclusively. All of its work, whether reached
//! through [`DetectionEngine::run_step`] or through the public operations,
//! runs on the single `&mut self` it hands out, so detection never races
//! itself.

use core::future::pending;
use core::marker::PhantomData;

use embassy_futures::select::{Either3, select3, select_array};
use smb1351_chgdet_traits::{ControlLines, IoError, Line, Transport};

use crate::access::RegisterAccess;
use crate::config::DetectionConfig;
use crate::counters::{Counter, CounterType};
use crate::detection::policy_manager::{ChargingPolicyManager, Event, SupplyChange, SupplyType};
use crate::irq::{IRQ_REG_COUNT, IRQ_TABLE, IrqEvent, slot_status, slot_triggered};
use crate::regs::{
    AC_INPUT_CURRENT_LIMIT_MASK, APSD_EN_BIT, AICL_EN_BIT, CMD_APSD_RE_RUN_BIT, CMD_CHG_EN_BIT,
    CMD_INCREMENT_QC3_BIT, CMD_INPUT_MODE_AC, CMD_INPUT_MODE_MASK, CMD_INPUT_MODE_USB500,
    CMD_OTG_EN_BIT, EN_BY_I2C_0_DISABLE, EN_PIN_CTRL_MASK, HVDCP_ADAPTER_SEL_9V,
    HVDCP_ADAPTER_SEL_MASK, HVDCP_EN_BIT, HvdcpStatus, IRQ_HVDCP_2P1_STATUS_BIT, InputStatus,
    LED_BLINK_FUNC_BIT, PortStatus, QC_2P1_AUTO_INCREMENT_BIT, Reg, USBCS_CTRL_BIT,
    USBCS_CTRL_BY_I2C,
};
use crate::timers::{Timer, TimerType};
use crate::units::{millivolts, to_millivolts};
use crate::{BatteryStatus, Error, HvdcpState, NegotiationStatus, PortType};

/// Progress of the classification loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClassifierState {
    /// Detection is off, or OTG suppresses it.
    #[default]
    Idle,
    /// Waiting for APSD to produce a result.
    Classifying,
    /// APSD came back empty, a rerun was issued.
    Retrying,
    /// A port type was latched.
    Resolved,
}

/// Snapshot of everything the engine believes about the attached port.
///
/// Reset to its initial values on every physical plug-out, except for the
/// battery flags, which track the battery rather than the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DetectionState {
    /// A cable is attached.
    pub attached: bool,
    /// Port detection is enabled.
    pub detection_enabled: bool,
    /// Latched port classification.
    pub port_type: PortType,
    /// Progress of the classification loop.
    pub classifier: ClassifierState,
    /// Result of high-voltage adapter detection.
    pub hvdcp: HvdcpState,
    /// Progress of the high-voltage negotiation.
    pub negotiation: NegotiationStatus,
    /// A D+/D- contract (QC2 or QC3) is in force.
    pub dpdm_negotiated: bool,
    /// Battery condition flags.
    pub battery: BatteryStatus,
    /// OTG is sourcing power; detection is suppressed.
    pub otg_enabled: bool,
    /// The input is in overvoltage lockout.
    pub usbin_ov: bool,
    rerun: Counter,
    hvdcp_probe: Counter,
    aicl_rerun: Counter,
    float_rerun_done: bool,
    uv_started_at: Option<u64>,
}

impl DetectionState {
    fn new(config: &DetectionConfig) -> Self {
        Self {
            attached: false,
            detection_enabled: false,
            port_type: PortType::Unknown,
            classifier: ClassifierState::Idle,
            hvdcp: HvdcpState::NotDetected,
            negotiation: NegotiationStatus::Idle,
            dpdm_negotiated: false,
            battery: BatteryStatus::default(),
            otg_enabled: false,
            usbin_ov: false,
            rerun: Counter::new(CounterType::ApsdRerun, config),
            hvdcp_probe: Counter::new(CounterType::HvdcpDetect, config),
            aicl_rerun: Counter::new(CounterType::HvdcpAiclRerun, config),
            float_rerun_done: false,
            uv_started_at: None,
        }
    }

    /// APSD reruns spent on the current classification.
    pub fn rerun_count(&self) -> u8 {
        self.rerun.value()
    }

    /// High-voltage probe attempts spent on the current attach.
    pub fn probe_count(&self) -> u8 {
        self.hvdcp_probe.value()
    }

    /// AICL reruns spent on the current contract.
    pub fn aicl_retry_count(&self) -> u8 {
        self.aicl_rerun.value()
    }

    /// Resets everything that tracks the attached port. Battery flags and
    /// the OTG/enable switches stay.
    fn reset_port(&mut self) {
        self.port_type = PortType::Unknown;
        self.classifier = ClassifierState::Idle;
        self.hvdcp = HvdcpState::NotDetected;
        self.negotiation = NegotiationStatus::Idle;
        self.dpdm_negotiated = false;
        self.usbin_ov = false;
        self.rerun.reset();
        self.hvdcp_probe.reset();
        self.aicl_rerun.reset();
        self.float_rerun_done = false;
        self.uv_started_at = None;
    }
}

/// Work the engine has put off to a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum DeferredTask {
    HvdcpDetect,
    HvdcpModeCheck,
    AiclSupervise,
    FloatCheck,
    CheckType,
    HvdcpRearm,
}

impl DeferredTask {
    const ALL: [DeferredTask; 6] = [
        DeferredTask::HvdcpDetect,
        DeferredTask::HvdcpModeCheck,
        DeferredTask::AiclSupervise,
        DeferredTask::FloatCheck,
        DeferredTask::CheckType,
        DeferredTask::HvdcpRearm,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Absolute deadlines of the deferred tasks. A cleared slot means the task
/// is not scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Deferred {
    deadlines: [Option<u64>; DeferredTask::ALL.len()],
}

impl Deferred {
    fn deadline(&self, task: DeferredTask) -> Option<u64> {
        self.deadlines[task.index()]
    }

    fn set(&mut self, task: DeferredTask, deadline: u64) {
        self.deadlines[task.index()] = Some(deadline);
    }

    fn cancel(&mut self, task: DeferredTask) {
        self.deadlines[task.index()] = None;
    }

    fn cancel_all(&mut self) {
        self.deadlines = [None; DeferredTask::ALL.len()];
    }
}

/// What woke the engine up.
enum Wake {
    Interrupt,
    PolicyEvent(Event),
    Deferred(DeferredTask),
}

#[derive(Default)]
struct ScanActions {
    classify: bool,
    collapse: bool,
}

/// The detection engine.
///
/// Drive it by awaiting [`Self::run`] (or [`Self::run_step`] in a loop); it
/// waits on the interrupt line, the policy manager's events, and its own
/// deferred work.
pub struct DetectionEngine<T, L, TIMER, M>
where
    T: Transport,
    L: ControlLines,
    TIMER: Timer,
    M: ChargingPolicyManager,
{
    regs: RegisterAccess<T>,
    lines: L,
    manager: M,
    config: DetectionConfig,
    state: DetectionState,
    /// Previous raw value of each interrupt status register, for edge
    /// detection. A register that fails to read keeps its previous value,
    /// so the edge is still seen on the next pass.
    irq_previous: [u8; IRQ_REG_COUNT],
    deferred: Deferred,
    hv_allowed: bool,
    _timer: PhantomData<TIMER>,
}

impl<T, L, TIMER, M> DetectionEngine<T, L, TIMER, M>
where
    T: Transport,
    L: ControlLines,
    TIMER: Timer,
    M: ChargingPolicyManager,
{
    /// Creates an engine around the given hardware and policy manager.
    pub fn new(transport: T, lines: L, manager: M, config: DetectionConfig) -> Self {
        let state = DetectionState::new(&config);

        Self {
            regs: RegisterAccess::new(transport),
            lines,
            manager,
            config,
            state,
            irq_previous: [0; IRQ_REG_COUNT],
            deferred: Deferred::default(),
            hv_allowed: true,
            _timer: PhantomData,
        }
    }

    /// The engine's current view of the attached port.
    pub fn state(&self) -> DetectionState {
        self.state
    }

    /// The latched port classification.
    pub fn port_type(&self) -> PortType {
        self.state.port_type
    }

    /// The high-voltage adapter detection result.
    pub fn hvdcp_type(&self) -> HvdcpState {
        self.state.hvdcp
    }

    /// Progress of the high-voltage negotiation.
    pub fn negotiation_status(&self) -> NegotiationStatus {
        self.state.negotiation
    }

    /// Access to the underlying register accessor.
    pub fn registers(&mut self) -> &mut RegisterAccess<T> {
        &mut self.regs
    }

    /// Runs the engine until an unrecoverable error occurs.
    pub async fn run(&mut self) -> Result<(), Error> {
        loop {
            self.run_step().await?;
        }
    }

    /// Waits for the next wakeup and handles it.
    ///
    /// Bus errors inside the handlers are logged and recovered locally; the
    /// hardware re-raises its interrupts, so a dropped cycle heals itself.
    pub async fn run_step(&mut self) -> Result<(), Error> {
        let wake = {
            let deferred = self.deferred;
            let interrupt = self.regs.transport_mut().wait_for_interrupt();
            let event = self.manager.get_event();
            let deadline = async move {
                let waits =
                    DeferredTask::ALL.map(|task| Self::deferred_wait(deferred.deadline(task), task));
                select_array(waits).await.0
            };

            match select3(interrupt, event, deadline).await {
                Either3::First(()) => Wake::Interrupt,
                Either3::Second(event) => Wake::PolicyEvent(event),
                Either3::Third(task) => Wake::Deferred(task),
            }
        };

        match wake {
            Wake::Interrupt => self.scan_interrupts().await,
            Wake::PolicyEvent(event) => self.handle_event(event).await,
            Wake::Deferred(task) => {
                self.deferred.cancel(task);
                self.run_deferred(task).await;
            }
        }

        Ok(())
    }

    async fn deferred_wait(deadline: Option<u64>, task: DeferredTask) -> DeferredTask {
        match deadline {
            Some(at) => {
                TIMER::after_millis(at.saturating_sub(TIMER::now_millis())).await;
                task
            }
            None => pending().await,
        }
    }

    fn schedule(&mut self, task: DeferredTask, delay: TimerType) {
        self.deferred
            .set(task, TIMER::now_millis() + delay.millis(&self.config));
    }

    async fn handle_event(&mut self, event: Event) {
        debug!("policy event: {:?}", event);

        let result = match event {
            Event::None => Ok(()),
            Event::EnableDetection(enable) => self.enable_detection(enable).await,
            Event::PlugIn => self.plug_in(),
            Event::PlugOut => self.plug_out(),
            Event::EnableOtg(enable) => self.enable_otg(enable).await,
            Event::CheckHighVoltagePolicy => self.check_high_voltage_policy().await,
        };

        if let Err(error) = result {
            warn!("policy event {:?} rejected: {:?}", event, error);
        }
    }

    async fn run_deferred(&mut self, task: DeferredTask) {
        trace!("deferred task: {:?}", task);

        let result = match task {
            DeferredTask::HvdcpDetect => self.hvdcp_detect().await,
            DeferredTask::HvdcpModeCheck => self.hvdcp_mode_check().await,
            DeferredTask::AiclSupervise => self.aicl_supervise().await,
            DeferredTask::FloatCheck => self.float_check().await,
            DeferredTask::CheckType => self.check_type().await,
            DeferredTask::HvdcpRearm => self.hvdcp_rearm().await,
        };

        if let Err(error) = result {
            warn!("deferred task {:?} aborted: {:?}", task, error);
        }
    }

    // Public operations. The policy manager reaches them either directly or
    // through `Event`s.

    /// Turns port detection on or off.
    ///
    /// Fails with [`Error::InvariantViolation`] while OTG is sourcing power.
    /// Enabling twice is a no-op.
    pub async fn enable_detection(&mut self, enable: bool) -> Result<(), Error> {
        if self.state.otg_enabled {
            return Err(Error::InvariantViolation);
        }

        if enable {
            if self.state.detection_enabled {
                debug!("detection already enabled");
                return Ok(());
            }

            info!("enabling port detection");
            self.deferred.cancel(DeferredTask::HvdcpRearm);
            self.state.detection_enabled = true;
            self.state.attached = true;
            self.lines.set_line(Line::Suspend, true);
            self.lines.set_line(Line::ConnectTherm, true);
            // Route D+/D- to the charger while APSD probes them.
            self.lines.set_line(Line::UsbSwitch, false);
            TimerType::UsbSwitchSettle.after::<TIMER>(&self.config).await;

            self.regs.enable_volatile_writes().await?;
            self.regs
                .masked_write(
                    Reg::CHG_PIN_EN_CTRL,
                    LED_BLINK_FUNC_BIT | EN_PIN_CTRL_MASK | USBCS_CTRL_BIT,
                    EN_BY_I2C_0_DISABLE | USBCS_CTRL_BY_I2C,
                )
                .await?;
            self.regs
                .masked_write(
                    Reg::VARIOUS_FUNC,
                    APSD_EN_BIT | AICL_EN_BIT,
                    APSD_EN_BIT | AICL_EN_BIT,
                )
                .await?;
            self.rerun_apsd().await?;

            self.state.rerun.reset();
            self.state.classifier = ClassifierState::Classifying;
            // Interrupts can get lost around enable; re-read the result
            // after a grace period.
            self.schedule(DeferredTask::CheckType, TimerType::CheckType);
        } else {
            info!("disabling port detection");
            self.state.detection_enabled = false;
            self.state.attached = false;
            self.deferred.cancel_all();
            self.state.reset_port();
            self.schedule(DeferredTask::HvdcpRearm, TimerType::HvdcpRearm);
            self.lines.set_line(Line::UsbSwitch, true);
            self.lines.set_line(Line::ConnectTherm, false);
            self.notify_supply(false).await;
        }

        Ok(())
    }

    /// Marks a cable as attached and starts a fresh detection cycle.
    pub fn plug_in(&mut self) -> Result<(), Error> {
        if self.state.otg_enabled {
            return Err(Error::InvariantViolation);
        }

        info!("plug in");
        self.state.attached = true;
        self.state.reset_port();

        Ok(())
    }

    /// Marks the cable as removed.
    ///
    /// Cancels all in-flight negotiation work and re-arms hardware adapter
    /// detection after a delay.
    pub fn plug_out(&mut self) -> Result<(), Error> {
        info!("plug out");
        self.state.attached = false;
        self.state.reset_port();
        self.deferred.cancel_all();
        self.schedule(DeferredTask::HvdcpRearm, TimerType::HvdcpRearm);

        Ok(())
    }

    /// Turns OTG power sourcing on or off.
    ///
    /// While sourcing, all detection activity is suppressed. Repeated calls
    /// with the same level are no-ops.
    pub async fn enable_otg(&mut self, enable: bool) -> Result<(), Error> {
        if enable == self.state.otg_enabled {
            debug!("otg already {}", enable);
            return Ok(());
        }

        if enable {
            info!("enabling otg");
            self.deferred.cancel_all();
            self.state.otg_enabled = true;
            self.state.classifier = ClassifierState::Idle;
            self.regs
                .masked_write(Reg::CMD_CHG, CMD_OTG_EN_BIT, CMD_OTG_EN_BIT)
                .await?;
        } else {
            info!("disabling otg");
            self.state.otg_enabled = false;
            self.regs.masked_write(Reg::CMD_CHG, CMD_OTG_EN_BIT, 0).await?;

            if self.state.attached && self.state.detection_enabled {
                self.rerun_apsd().await?;
                self.state.rerun.reset();
                self.state.classifier = ClassifierState::Classifying;
                self.schedule(DeferredTask::CheckType, TimerType::CheckType);
            }
        }

        Ok(())
    }

    /// Re-evaluates the platform's high-voltage charging policy.
    ///
    /// When the policy newly forbids it, an active QC contract is torn down
    /// and the adapter re-classified at 5 V. When the policy newly allows it
    /// on a dedicated charger, the probe starts over.
    pub async fn check_high_voltage_policy(&mut self) -> Result<(), Error> {
        let allowed = self.manager.high_voltage_charging_allowed().await;

        if allowed == self.hv_allowed {
            return Ok(());
        }
        self.hv_allowed = allowed;
        info!("high-voltage charging allowed: {}", allowed);

        if !allowed {
            // A probe still pending on a dedicated charger must not fire
            // either; the adapter stays at its 5 V default.
            self.deferred.cancel(DeferredTask::HvdcpDetect);

            if self.state.hvdcp != HvdcpState::NotDetected {
                self.deferred.cancel(DeferredTask::HvdcpModeCheck);
                self.state.hvdcp = HvdcpState::NotDetected;
                self.state.dpdm_negotiated = false;
                self.state.negotiation = NegotiationStatus::Idle;
                self.state.hvdcp_probe.reset();
                self.state.aicl_rerun.reset();

                // Pause charging while the input drops back to 5 V.
                self.regs.masked_write(Reg::CMD_CHG, CMD_CHG_EN_BIT, 0).await?;
                self.set_hvdcp_hw(false).await?;
                self.rerun_apsd().await?;
                self.regs
                    .masked_write(Reg::CMD_CHG, CMD_CHG_EN_BIT, CMD_CHG_EN_BIT)
                    .await?;
            }
        } else if self.state.port_type == PortType::DedicatedCharger
            && self.state.hvdcp == HvdcpState::NotDetected
        {
            self.set_hvdcp_hw(true).await?;
            self.rerun_apsd().await?;
            self.state.hvdcp_probe.reset();
            self.state.negotiation = NegotiationStatus::Idle;
            self.schedule(DeferredTask::HvdcpDetect, TimerType::HvdcpDetect);
        }

        Ok(())
    }

    // Interrupt handling.

    /// Reads the whole interrupt status block and dispatches every source
    /// that triggered or whose rt-status changed.
    async fn scan_interrupts(&mut self) {
        let vbus = self.manager.bus_voltage().await;
        trace!("interrupt, vbus {} mV", to_millivolts(vbus));

        if self.state.otg_enabled {
            // Reading the block acknowledged the interrupt; nothing else
            // may run while we source power.
            debug!("interrupt ignored while otg is active");
            return;
        }

        let now = TIMER::now_millis();
        let mut actions = ScanActions::default();

        for (index, entry) in IRQ_TABLE.iter().enumerate() {
            let value = match self.regs.read(entry.reg).await {
                Ok(value) => value,
                // Skip the register; keeping the previous value preserves
                // the edge for the next scan.
                Err(_) => continue,
            };
            let previous = self.irq_previous[index];

            for (slot, descriptor) in entry.slots.iter().enumerate() {
                let triggered = slot_triggered(value, slot);
                let status = slot_status(value, slot);
                let changed = status != slot_status(previous, slot);

                if !(triggered || changed) {
                    continue;
                }

                trace!("irq {}: status {}", descriptor.name, status);
                if let Some(event) = descriptor.event {
                    self.handle_irq_event(event, status, now, &mut actions);
                }
            }

            self.irq_previous[index] = value;
        }

        if actions.collapse {
            self.hvdcp_collapse().await;
            actions.classify = true;
        }

        if actions.classify
            && let Err(error) = self.classify().await
        {
            warn!("classification aborted: {:?}", error);
        }
    }

    fn handle_irq_event(&mut self, event: IrqEvent, status: bool, now: u64, actions: &mut ScanActions) {
        match event {
            IrqEvent::ColdSoft => self.state.battery.cool = status,
            IrqEvent::HotSoft => self.state.battery.warm = status,
            IrqEvent::ColdHard => self.state.battery.cold = status,
            IrqEvent::HotHard => self.state.battery.hot = status,
            IrqEvent::BatteryMissing => {
                if status {
                    warn!("battery missing");
                }
                self.state.battery.missing = status;
            }
            IrqEvent::ChargeTerminated => debug!("charge terminated: {}", status),
            IrqEvent::UsbinUv => {
                if status {
                    self.state.uv_started_at = Some(now);
                } else if let Some(start) = self.state.uv_started_at.take()
                    && now.wrapping_sub(start) < self.config.vbus_collapse_window_ms
                    && self.state.hvdcp != HvdcpState::NotDetected
                {
                    actions.collapse = true;
                }
            }
            IrqEvent::UsbinOv => {
                self.state.usbin_ov = status;
                if status {
                    warn!("input overvoltage");
                } else {
                    // Back in range; the classification may have been lost.
                    actions.classify = true;
                }
            }
            IrqEvent::ApsdComplete => {
                if status {
                    actions.classify = true;
                }
            }
            IrqEvent::AiclDone => debug!("aicl done: {}", status),
            IrqEvent::AiclFail => debug!("aicl fail: {}", status),
            IrqEvent::HvdcpAuthDone => debug!("hvdcp auth done: {}", status),
        }
    }

    // Classification.

    /// Reads the APSD result and latches a port type, rerunning APSD a
    /// bounded number of times while the result register stays empty.
    async fn classify(&mut self) -> Result<(), IoError> {
        if !self.state.detection_enabled || self.state.otg_enabled {
            return Ok(());
        }

        self.state.classifier = ClassifierState::Classifying;

        let port_type = loop {
            self.regs.enable_volatile_writes().await?;
            let status = PortStatus(self.regs.read(Reg::STATUS_5).await?);
            let port_type = Self::classify_status(status);
            debug!("apsd result {:?} -> {:?}", status, port_type);

            if port_type != PortType::Unknown {
                break port_type;
            }

            if self.state.rerun.increment().is_err() {
                break PortType::Unknown;
            }

            self.state.classifier = ClassifierState::Retrying;
            self.rerun_apsd().await?;
        };

        self.state.port_type = port_type;

        if port_type == PortType::Unknown {
            error!("classification exhausted its reruns");
            self.state.classifier = ClassifierState::Idle;
            self.state.hvdcp = HvdcpState::NotDetected;
            self.state.dpdm_negotiated = false;
            self.state.negotiation = NegotiationStatus::Idle;
            self.state.hvdcp_probe.reset();
            // No supply change is reported for an unresolved port.
            return Ok(());
        }

        self.state.rerun.reset();
        self.state.classifier = ClassifierState::Resolved;

        match port_type {
            PortType::StandardDownstream => {
                // Hand D+/D- back so the host can enumerate, then verify
                // that it actually does.
                self.lines.set_line(Line::UsbSwitch, true);
                TimerType::UsbSwitchSettle.after::<TIMER>(&self.config).await;
                self.state.float_rerun_done = false;
                self.schedule(DeferredTask::FloatCheck, TimerType::FloatCheck);
            }
            PortType::ChargingDownstream => {
                self.lines.set_line(Line::UsbSwitch, true);
                TimerType::UsbSwitchSettle.after::<TIMER>(&self.config).await;
            }
            PortType::DedicatedCharger => {
                if self.config.auto_hvdcp && self.hv_allowed {
                    self.state.negotiation = NegotiationStatus::Idle;
                    self.state.hvdcp_probe.reset();
                    self.schedule(DeferredTask::HvdcpDetect, TimerType::HvdcpDetect);
                }
                self.state.aicl_rerun.reset();
                self.schedule(DeferredTask::AiclSupervise, TimerType::AiclFirstCheck);
            }
            _ => {}
        }

        self.notify_supply(true).await;
        Ok(())
    }

    fn classify_status(status: PortStatus) -> PortType {
        // Fixed priority: the dedicated-charger bits win over the host bits.
        if status.dcp() || status.other_charging_port() {
            PortType::DedicatedCharger
        } else if status.cdp() {
            PortType::ChargingDownstream
        } else if status.sdp() {
            PortType::StandardDownstream
        } else if status.aca() != 0 {
            PortType::NonStandard
        } else if status.0 != 0 {
            PortType::StandardDownstream
        } else {
            PortType::Unknown
        }
    }

    async fn rerun_apsd(&mut self) -> Result<(), IoError> {
        info!("rerunning apsd");
        self.regs
            .masked_write(Reg::CMD_HVDCP, CMD_APSD_RE_RUN_BIT, CMD_APSD_RE_RUN_BIT)
            .await
    }

    // High-voltage negotiation.

    /// Probes for a QC adapter on a dedicated charging port.
    async fn hvdcp_detect(&mut self) -> Result<(), IoError> {
        if self.state.port_type != PortType::DedicatedCharger
            || self.state.hvdcp != HvdcpState::NotDetected
            || !self.hv_allowed
        {
            return Ok(());
        }

        let vbus = self.manager.bus_voltage().await;
        if vbus < millivolts(self.config.vbus_present_threshold_mv) {
            // The bus is not up yet; recheck later without spending a retry.
            debug!("bus below presence threshold, deferring hvdcp probe");
            self.schedule(DeferredTask::HvdcpDetect, TimerType::HvdcpDetect);
            return Ok(());
        }

        self.state.negotiation = NegotiationStatus::Probing;

        let hvdcp_status = HvdcpStatus(self.regs.read(Reg::STATUS_7).await?);
        let auth_status = self.regs.read(Reg::IRQ_H).await?;

        if auth_status & IRQ_HVDCP_2P1_STATUS_BIT != 0 {
            info!("qc3 adapter detected");
            self.step_adapter_voltage().await?;
            self.state.hvdcp = HvdcpState::Qc3;
            self.state.dpdm_negotiated = true;
            self.state.negotiation = NegotiationStatus::Complete;
            self.state.aicl_rerun.reset();
            self.schedule(DeferredTask::HvdcpModeCheck, TimerType::HvdcpModeCheck);
            self.notify_supply(true).await;
        } else if hvdcp_status.qc_detected() {
            info!("qc2 adapter detected, selecting 9 V");
            self.regs.enable_volatile_writes().await?;
            self.regs
                .masked_write(Reg::HVDCP_CTRL, HVDCP_ADAPTER_SEL_MASK, HVDCP_ADAPTER_SEL_9V)
                .await?;
            self.state.hvdcp = HvdcpState::Qc2;
            self.state.dpdm_negotiated = true;
            self.state.negotiation = NegotiationStatus::Complete;
            self.state.aicl_rerun.reset();
            self.schedule(DeferredTask::HvdcpModeCheck, TimerType::HvdcpModeCheck);
            self.notify_supply(true).await;
        } else if self.state.hvdcp_probe.increment().is_ok() {
            debug!(
                "no qc adapter yet, probe attempt {}",
                self.state.hvdcp_probe.value()
            );
            self.schedule(DeferredTask::HvdcpDetect, TimerType::HvdcpDetect);
        } else {
            warn!("hvdcp probe timed out");
            self.state.negotiation = NegotiationStatus::TimedOut;
            self.set_hvdcp_hw(false).await?;
            self.rerun_apsd().await?;
        }

        Ok(())
    }

    /// Raises the adapter voltage by issuing QC3 increment pulses.
    ///
    /// The pulse count is derived from the configured target voltage, but
    /// never exceeds the configured bound.
    async fn step_adapter_voltage(&mut self) -> Result<(), IoError> {
        self.regs.enable_volatile_writes().await?;
        self.regs
            .masked_write(Reg::VARIOUS_FUNC_3, QC_2P1_AUTO_INCREMENT_BIT, 0)
            .await?;

        let pulses = self.config.qc3_pulse_count();
        for pulse in 0..pulses {
            trace!("qc3 increment pulse {}", pulse + 1);
            self.regs
                .masked_write(Reg::CMD_HVDCP, CMD_INCREMENT_QC3_BIT, CMD_INCREMENT_QC3_BIT)
                .await?;
            TimerType::PulseSettle.after::<TIMER>(&self.config).await;
        }

        info!("requested {} mV with {} pulses", self.config.qc3_target_mv, pulses);
        Ok(())
    }

    /// Verifies that the negotiated contract still delivers. A QC adapter
    /// that sagged into 500 mA mode gets a bounded number of AICL restarts;
    /// after that, the contract is abandoned.
    async fn hvdcp_mode_check(&mut self) -> Result<(), IoError> {
        if self.state.hvdcp == HvdcpState::NotDetected {
            return Ok(());
        }

        let input = InputStatus(self.regs.read(Reg::STATUS_0).await?);

        if input.usb500_mode() {
            if self.state.aicl_rerun.increment().is_ok() {
                warn!(
                    "input sagged to 500 mA mode, aicl restart {}",
                    self.state.aicl_rerun.value()
                );
                self.rerun_aicl().await?;
            } else {
                warn!("input stuck in 500 mA mode, abandoning the contract");
                self.state.hvdcp = HvdcpState::NotDetected;
                self.state.dpdm_negotiated = false;
                self.state.negotiation = NegotiationStatus::Idle;
                self.state.aicl_rerun.reset();
                self.state.rerun.reset();
                self.set_hvdcp_hw(false).await?;
                self.rerun_apsd().await?;
                return Ok(());
            }
        } else {
            self.state.aicl_rerun.reset();
        }

        self.schedule(DeferredTask::HvdcpModeCheck, TimerType::HvdcpModeCheck);
        Ok(())
    }

    /// Restarts AICL by bouncing the input mode through USB 500 and back to
    /// AC.
    async fn rerun_aicl(&mut self) -> Result<(), IoError> {
        self.regs
            .masked_write(Reg::CMD_INPUT_LIMIT, CMD_INPUT_MODE_MASK, CMD_INPUT_MODE_USB500)
            .await?;
        TimerType::AiclSettle.after::<TIMER>(&self.config).await;
        self.regs
            .masked_write(Reg::CMD_INPUT_LIMIT, CMD_INPUT_MODE_MASK, CMD_INPUT_MODE_AC)
            .await?;
        TimerType::AiclSettle.after::<TIMER>(&self.config).await;

        Ok(())
    }

    /// Compares the granted input current against the configured limit and
    /// restarts AICL when the grant fell short.
    async fn aicl_supervise(&mut self) -> Result<(), IoError> {
        if self.state.port_type != PortType::DedicatedCharger {
            return Ok(());
        }

        let granted = InputStatus(self.regs.read(Reg::STATUS_0).await?).granted_limit();
        let configured = self.regs.read(Reg::CHG_CURRENT_CTRL).await? & AC_INPUT_CURRENT_LIMIT_MASK;

        if configured > granted {
            info!("aicl granted {} below configured {}, restarting", granted, configured);
            self.rerun_aicl().await?;

            // One corrective restart per period; a grant that is still short
            // is only logged.
            let granted = InputStatus(self.regs.read(Reg::STATUS_0).await?).granted_limit();
            if configured > granted {
                debug!("aicl grant still {} after restart", granted);
            }
        }

        self.schedule(DeferredTask::AiclSupervise, TimerType::AiclSupervise);
        Ok(())
    }

    /// Checks whether a standard port actually enumerated. A silent one
    /// gets one APSD rerun and a grace period; if it still will not talk,
    /// it is declared floating and charged like a dedicated charger.
    async fn float_check(&mut self) -> Result<(), IoError> {
        if self.state.port_type != PortType::StandardDownstream {
            return Ok(());
        }

        if self.manager.is_enumerated().await {
            debug!("host enumerated, port is a real sdp");
            return Ok(());
        }

        if !self.state.float_rerun_done {
            self.state.float_rerun_done = true;
            self.rerun_apsd().await?;
            TimerType::FloatRecheck.after::<TIMER>(&self.config).await;
        }

        let vbus = self.manager.bus_voltage().await;
        if !self.manager.is_enumerated().await
            && vbus >= millivolts(self.config.vbus_present_threshold_mv)
            && self.state.port_type == PortType::StandardDownstream
        {
            info!("port never enumerated, treating it as a floating charger");
            self.state.port_type = PortType::Float;
            self.notify_supply(true).await;
        }

        Ok(())
    }

    /// Safety net for a lost completion interrupt: re-reads the result
    /// register and classifies if it holds a result we never saw.
    async fn check_type(&mut self) -> Result<(), IoError> {
        if self.state.port_type != PortType::Unknown {
            return Ok(());
        }

        let status = self.regs.read(Reg::STATUS_5).await?;
        if status != 0 {
            warn!("classification interrupt was lost, recovering");
            self.classify().await?;
        }

        Ok(())
    }

    /// Re-enables hardware adapter detection once the old source is gone.
    async fn hvdcp_rearm(&mut self) -> Result<(), IoError> {
        let vbus = self.manager.bus_voltage().await;

        if vbus < millivolts(self.config.vbus_present_threshold_mv) {
            self.set_hvdcp_hw(true).await?;
        }

        Ok(())
    }

    /// Tears down a collapsed QC contract and starts classification over.
    async fn hvdcp_collapse(&mut self) {
        warn!("high-voltage contract collapsed, reverting to 5 V");
        self.deferred.cancel(DeferredTask::HvdcpDetect);
        self.deferred.cancel(DeferredTask::HvdcpModeCheck);
        self.state.hvdcp = HvdcpState::NotDetected;
        self.state.dpdm_negotiated = false;
        self.state.negotiation = NegotiationStatus::Idle;
        self.state.hvdcp_probe.reset();
        self.state.aicl_rerun.reset();
        self.state.rerun.reset();

        if let Err(error) = self.set_hvdcp_hw(false).await {
            warn!("could not disable hvdcp detection: {:?}", error);
        }
        if let Err(error) = self.rerun_apsd().await {
            warn!("could not rerun apsd: {:?}", error);
        }
    }

    async fn set_hvdcp_hw(&mut self, enable: bool) -> Result<(), IoError> {
        self.regs.enable_volatile_writes().await?;
        self.regs
            .masked_write(
                Reg::HVDCP_CTRL,
                HVDCP_EN_BIT,
                if enable { HVDCP_EN_BIT } else { 0 },
            )
            .await
    }

    async fn notify_supply(&mut self, online: bool) {
        let kind = if online {
            SupplyType::from_detection(self.state.port_type, self.state.hvdcp)
        } else {
            SupplyType::Unknown
        };

        info!("supply changed: {:?}, online {}", kind, online);
        self.manager
            .power_supply_changed(SupplyChange { kind, online })
            .await;
    }
}

#[cfg(test)]
mod tests;

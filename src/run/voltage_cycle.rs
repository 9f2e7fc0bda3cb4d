//! Voltage ladder cycles on the power supply.
//!
//! The up pass programs `vmin ..= vmax` in `vstep` rungs; the down pass
//! starts one rung below `vmax` and walks back to `vmin`, so an up/down
//! sweep never programs the turning point twice. With `back_to_min`, every
//! rung is followed by a return to `vmin` with its own dwell (relaxation
//! measurements).

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use tokio::sync::broadcast;

use super::Direction;
use crate::core::{DataPoint, Interferometer, PowerSupply, StorageWriter};
use crate::worker::CancelFlag;

/// Rung comparison tolerance; steps are display-resolution volts.
const EPS: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct VoltageCycleParams {
    pub vmin: f64,
    pub vmax: f64,
    pub vstep: f64,
    pub dwell: Duration,
    /// Dwell at `vmin` after each rung when `back_to_min` is set.
    pub dwell_low: Duration,
    pub direction: Direction,
    pub back_to_min: bool,
}

impl VoltageCycleParams {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.vstep > 0.0, "voltage step must be positive");
        ensure!(self.vmin > 0.0, "vmin must be positive");
        ensure!(
            self.vmax >= self.vmin,
            "vmax ({}) must be at least vmin ({})",
            self.vmax,
            self.vmin
        );
        Ok(())
    }

    /// Expand the sweep into the programmed rung sequence.
    pub fn ladder(&self) -> Vec<f64> {
        let mut rungs = Vec::new();
        for sign in self.direction.signs() {
            match sign {
                crate::core::Sign::Plus => {
                    let mut v = self.vmin;
                    while v <= self.vmax + EPS {
                        rungs.push(v);
                        v += self.vstep;
                    }
                }
                crate::core::Sign::Minus => {
                    let mut v = self.vmax - self.vstep;
                    while v >= self.vmin - EPS {
                        rungs.push(v);
                        v -= self.vstep;
                    }
                }
            }
        }
        rungs
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageCycleReport {
    pub rungs_executed: u32,
    pub final_voltage: f64,
    pub cancelled: bool,
}

/// Run a voltage ladder, logging each rung, with the same logging, recording
/// and cancellation contract as the motor cycle.
pub async fn run_voltage_cycle<P: PowerSupply + ?Sized>(
    supply: &mut P,
    params: &VoltageCycleParams,
    cancel: &CancelFlag,
    mut writer: Option<&mut dyn StorageWriter>,
    events: Option<&broadcast::Sender<DataPoint>>,
    mut interferometer: Option<&mut dyn Interferometer>,
) -> Result<VoltageCycleReport> {
    params.validate()?;

    if let Some(ids) = interferometer.as_deref_mut() {
        let path = ids
            .start_recording()
            .await
            .context("could not start interferometer recording")?;
        log::info!(
            "AGILENT: cycle recording displacement to {}",
            path.display()
        );
    }

    let result = cycle_loop(supply, params, cancel, &mut writer, events).await;

    if let Some(ids) = interferometer.as_deref_mut() {
        if let Err(e) = ids.stop_recording().await {
            log::warn!("AGILENT: could not stop interferometer recording: {e:#}");
        }
    }
    if let Some(w) = writer.as_deref_mut() {
        if let Err(e) = w.shutdown().await {
            log::warn!("AGILENT: could not close sample log: {e:#}");
        }
    }
    result
}

async fn cycle_loop<P: PowerSupply + ?Sized>(
    supply: &mut P,
    params: &VoltageCycleParams,
    cancel: &CancelFlag,
    writer: &mut Option<&mut dyn StorageWriter>,
    events: Option<&broadcast::Sender<DataPoint>>,
) -> Result<VoltageCycleReport> {
    let ladder = params.ladder();
    log::info!(
        "AGILENT: ladder start: {} rungs {} from {:.1} V to {:.1} V, step {:.1} V",
        ladder.len(),
        params.direction.as_str(),
        params.vmin,
        params.vmax,
        params.vstep
    );

    supply.output_on().await.context("output enable failed")?;

    let mut rungs_executed = 0u32;
    let mut cancelled = false;

    for &rung in &ladder {
        if cancel.is_cancelled() {
            log::info!("AGILENT: ladder cancelled after {rungs_executed} rungs");
            cancelled = true;
            break;
        }

        emit(supply.id(), rung, writer, events).await?;
        supply
            .set_voltage(rung)
            .await
            .with_context(|| format!("programming rung {rung:.1} V failed"))?;
        tokio::time::sleep(params.dwell).await;
        emit(supply.id(), rung, writer, events).await?;
        rungs_executed += 1;

        if params.back_to_min && (rung - params.vmin).abs() > EPS {
            emit(supply.id(), params.vmin, writer, events).await?;
            supply
                .set_voltage(params.vmin)
                .await
                .context("return to vmin failed")?;
            tokio::time::sleep(params.dwell_low).await;
            emit(supply.id(), params.vmin, writer, events).await?;
        }
    }

    let final_voltage = supply.programmed_voltage();
    log::info!(
        "AGILENT: ladder done: {rungs_executed} rungs, final setpoint {final_voltage:.1} V"
    );
    Ok(VoltageCycleReport {
        rungs_executed,
        final_voltage,
        cancelled,
    })
}

async fn emit(
    instrument: &str,
    volts: f64,
    writer: &mut Option<&mut dyn StorageWriter>,
    events: Option<&broadcast::Sender<DataPoint>>,
) -> Result<()> {
    let point = DataPoint::now(instrument, "voltage", volts, "V");
    if let Some(w) = writer.as_deref_mut() {
        w.write(std::slice::from_ref(&point)).await?;
    }
    if let Some(tx) = events {
        let _ = tx.send(point);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Instrument;
    use crate::hardware::mock::MockAdapter;
    use crate::instrument::supply::{AgilentE3631A, Rail};

    async fn connected_supply() -> (AgilentE3631A, MockAdapter) {
        let mock = MockAdapter::new();
        mock.on("*IDN?", "HEWLETT-PACKARD,E3631A,0,2.1-5.0-1.0");
        let mut supply = AgilentE3631A::new("agilent", Box::new(mock.clone()), Rail::P25V, 0.5);
        supply.initialize().await.unwrap();
        mock.clear_sent();
        (supply, mock)
    }

    fn params(direction: Direction) -> VoltageCycleParams {
        VoltageCycleParams {
            vmin: 1.0,
            vmax: 1.3,
            vstep: 0.1,
            dwell: Duration::ZERO,
            dwell_low: Duration::ZERO,
            direction,
            back_to_min: false,
        }
    }

    fn rounded(ladder: Vec<f64>) -> Vec<f64> {
        ladder.iter().map(|v| (v * 10.0).round() / 10.0).collect()
    }

    #[test]
    fn ladders_expand_without_doubling_the_turning_point() {
        assert_eq!(
            rounded(params(Direction::Up).ladder()),
            vec![1.0, 1.1, 1.2, 1.3]
        );
        assert_eq!(
            rounded(params(Direction::Down).ladder()),
            vec![1.2, 1.1, 1.0]
        );
        assert_eq!(
            rounded(params(Direction::UpDown).ladder()),
            vec![1.0, 1.1, 1.2, 1.3, 1.2, 1.1, 1.0]
        );
    }

    #[test]
    fn single_rung_sweep_is_just_vmin() {
        let mut p = params(Direction::Up);
        p.vmax = 1.0;
        assert_eq!(rounded(p.ladder()), vec![1.0]);
        assert_eq!(rounded(params(Direction::Down).ladder()).len(), 3);
    }

    #[test]
    fn invalid_params_are_rejected() {
        let mut p = params(Direction::Up);
        p.vstep = 0.0;
        assert!(p.validate().is_err());
        let mut p = params(Direction::Up);
        p.vmax = 0.5;
        assert!(p.validate().is_err());
    }

    #[tokio::test]
    async fn rungs_program_the_supply_in_order() {
        let (mut supply, mock) = connected_supply().await;
        let cancel = CancelFlag::new();

        let report = run_voltage_cycle(
            &mut supply,
            &params(Direction::Up),
            &cancel,
            None,
            None,
            None,
        )
        .await
        .unwrap();

        assert_eq!(report.rungs_executed, 4);
        assert!(!report.cancelled);
        assert_eq!(
            mock.sent(),
            vec![
                "OUTP ON",
                "VOLT 1.0",
                "VOLT 1.1",
                "VOLT 1.2",
                "VOLT 1.3",
            ]
        );
    }

    #[tokio::test]
    async fn back_to_min_returns_after_each_high_rung() {
        let (mut supply, mock) = connected_supply().await;
        let cancel = CancelFlag::new();
        let mut p = params(Direction::Up);
        p.vmax = 1.1;
        p.back_to_min = true;

        run_voltage_cycle(&mut supply, &p, &cancel, None, None, None)
            .await
            .unwrap();

        // vmin itself does not bounce; higher rungs do.
        assert_eq!(
            mock.sent(),
            vec!["OUTP ON", "VOLT 1.0", "VOLT 1.1", "VOLT 1.0"]
        );
    }

    #[tokio::test]
    async fn cancellation_stops_the_ladder() {
        let (mut supply, mock) = connected_supply().await;
        let cancel = CancelFlag::new();
        cancel.cancel();

        let report = run_voltage_cycle(
            &mut supply,
            &params(Direction::Up),
            &cancel,
            None,
            None,
            None,
        )
        .await
        .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.rungs_executed, 0);
        assert_eq!(mock.sent(), vec!["OUTP ON"]);
    }
}

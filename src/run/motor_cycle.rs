//! Repeated relative-move cycles on the picomotor.
//!
//! Each iteration logs the position before the move, after the move, and
//! after the dwell. Position is bookkept in software from the starting
//! readback: the controller's open-loop step counter drifts much less than a
//! per-step `TP?` round trip costs.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use tokio::sync::broadcast;

use super::Direction;
use crate::core::{DataPoint, Interferometer, Motor, StorageWriter};
use crate::worker::CancelFlag;

#[derive(Debug, Clone)]
pub struct MotorCycleParams {
    pub channel: u8,
    /// Steps per move, positive; the direction supplies the sign.
    pub steps: u32,
    /// Moves per direction pass.
    pub cycles: u32,
    pub dwell: Duration,
    pub direction: Direction,
}

impl MotorCycleParams {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.steps > 0, "steps per move must be positive");
        ensure!(self.cycles > 0, "cycle count must be positive");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorCycleReport {
    pub moves_executed: u32,
    pub final_position: i64,
    pub cancelled: bool,
}

/// Run a motor cycle, optionally logging to `writer`, publishing samples on
/// `events`, and bracketing the run with an interferometer recording.
///
/// The writer is closed and the recording stopped on every exit path,
/// including cancellation and errors.
pub async fn run_motor_cycle<M: Motor + ?Sized>(
    motor: &mut M,
    params: &MotorCycleParams,
    cancel: &CancelFlag,
    mut writer: Option<&mut dyn StorageWriter>,
    events: Option<&broadcast::Sender<DataPoint>>,
    mut interferometer: Option<&mut dyn Interferometer>,
) -> Result<MotorCycleReport> {
    params.validate()?;

    if let Some(ids) = interferometer.as_deref_mut() {
        let path = ids
            .start_recording()
            .await
            .context("could not start interferometer recording")?;
        log::info!("MOTOR: cycle recording displacement to {}", path.display());
    }

    let result = cycle_loop(motor, params, cancel, &mut writer, events).await;

    if let Some(ids) = interferometer.as_deref_mut() {
        if let Err(e) = ids.stop_recording().await {
            log::warn!("MOTOR: could not stop interferometer recording: {e:#}");
        }
    }
    if let Some(w) = writer.as_deref_mut() {
        if let Err(e) = w.shutdown().await {
            log::warn!("MOTOR: could not close sample log: {e:#}");
        }
    }
    result
}

async fn cycle_loop<M: Motor + ?Sized>(
    motor: &mut M,
    params: &MotorCycleParams,
    cancel: &CancelFlag,
    writer: &mut Option<&mut dyn StorageWriter>,
    events: Option<&broadcast::Sender<DataPoint>>,
) -> Result<MotorCycleReport> {
    let mut position = motor
        .position(params.channel)
        .await
        .context("could not read starting position")?;
    log::info!(
        "MOTOR: cycle start: {} x {} steps {}, dwell {:?}, from position {}",
        params.cycles,
        params.steps,
        params.direction.as_str(),
        params.dwell,
        position
    );

    let mut moves_executed = 0u32;
    let mut cancelled = false;

    'passes: for sign in params.direction.signs() {
        let delta = i64::from(params.steps) * sign.factor();
        for _ in 0..params.cycles {
            if cancel.is_cancelled() {
                log::info!("MOTOR: cycle cancelled after {moves_executed} moves");
                cancelled = true;
                break 'passes;
            }

            emit(motor.id(), position, writer, events).await?;
            motor
                .move_relative(params.channel, delta)
                .await
                .with_context(|| format!("relative move of {delta} steps failed"))?;
            position += delta;
            emit(motor.id(), position, writer, events).await?;

            tokio::time::sleep(params.dwell).await;
            emit(motor.id(), position, writer, events).await?;
            moves_executed += 1;
        }
    }

    log::info!(
        "MOTOR: cycle done: {moves_executed} moves, final position {position}"
    );
    Ok(MotorCycleReport {
        moves_executed,
        final_position: position,
        cancelled,
    })
}

async fn emit(
    instrument: &str,
    position: i64,
    writer: &mut Option<&mut dyn StorageWriter>,
    events: Option<&broadcast::Sender<DataPoint>>,
) -> Result<()> {
    let point = DataPoint::now(instrument, "position", position as f64, "steps");
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
    use crate::instrument::Picomotor;

    async fn connected_motor() -> (Picomotor, MockAdapter) {
        let mock = MockAdapter::new();
        mock.on("VE?", "8742 Version 2.2 08/01/13");
        mock.on("1>1 QM?", "1>3");
        mock.on("1>2 QM?", "1>0");
        mock.on("1>3 QM?", "1>0");
        mock.on("1>4 QM?", "1>0");
        mock.on("1>1 TP?", "1>0");
        let mut motor = Picomotor::new("picomotor", Box::new(mock.clone()), 2000, 100_000);
        motor.initialize().await.unwrap();
        mock.clear_sent();
        (motor, mock)
    }

    fn params(direction: Direction) -> MotorCycleParams {
        MotorCycleParams {
            channel: 1,
            steps: 100,
            cycles: 2,
            dwell: Duration::ZERO,
            direction,
        }
    }

    #[tokio::test]
    async fn updown_issues_both_passes() {
        let (mut motor, mock) = connected_motor().await;
        let cancel = CancelFlag::new();

        let report = run_motor_cycle(
            &mut motor,
            &params(Direction::UpDown),
            &cancel,
            None,
            None,
            None,
        )
        .await
        .unwrap();

        assert_eq!(report.moves_executed, 4);
        assert_eq!(report.final_position, 0);
        assert!(!report.cancelled);
        assert_eq!(
            mock.sent(),
            vec![
                "1>1 TP?",
                "1>1 PR +100",
                "1>1 PR +100",
                "1>1 PR -100",
                "1>1 PR -100",
            ]
        );
    }

    #[tokio::test]
    async fn positions_are_bookkept_per_move() {
        let (mut motor, _mock) = connected_motor().await;
        let cancel = CancelFlag::new();
        let publisher = motor.publisher();
        let mut samples = motor.data_channel();

        let report = run_motor_cycle(
            &mut motor,
            &params(Direction::Up),
            &cancel,
            None,
            Some(&publisher),
            None,
        )
        .await
        .unwrap();
        assert_eq!(report.final_position, 200);

        // Three samples per move: pre-move, post-move, post-dwell.
        let mut values = Vec::new();
        while let Ok(point) = samples.try_recv() {
            values.push(point.value);
        }
        assert_eq!(values, vec![0.0, 100.0, 100.0, 100.0, 200.0, 200.0]);
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_move() {
        let (mut motor, mock) = connected_motor().await;
        let cancel = CancelFlag::new();
        cancel.cancel();

        let report = run_motor_cycle(
            &mut motor,
            &params(Direction::Up),
            &cancel,
            None,
            None,
            None,
        )
        .await
        .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.moves_executed, 0);
        // Only the starting position readback went out.
        assert_eq!(mock.sent(), vec!["1>1 TP?"]);
    }

    #[tokio::test]
    async fn zero_step_params_are_rejected() {
        let (mut motor, _mock) = connected_motor().await;
        let cancel = CancelFlag::new();
        let mut bad = params(Direction::Up);
        bad.steps = 0;

        assert!(
            run_motor_cycle(&mut motor, &bad, &cancel, None, None, None)
                .await
                .is_err()
        );
    }
}

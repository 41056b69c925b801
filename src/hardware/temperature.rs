// src/hardware/temperature.rs
use std::time::Instant;

/// PID loop for one heater. Output is a PWM duty in [0, 1].
#[derive(Debug, Clone)]
pub struct PidController {
    kp: f64,
    ki: f64,
    kd: f64,
    integral: f64,
    previous_error: f64,
    previous_time: Option<Instant>,
    target: f64,
}

impl PidController {
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self { kp, ki, kd, integral: 0.0, previous_error: 0.0, previous_time: None, target: 0.0 }
    }

    pub fn set_target(&mut self, target: f64) {
        self.target = target;
        if target == 0.0 {
            self.reset();
        }
        tracing::info!("heater target set to {:.1}C", target);
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn compute(&mut self, now: Instant, current: f64) -> f64 {
        if self.target <= 0.0 {
            return 0.0;
        }
        let error = self.target - current;
        let dt = match self.previous_time {
            Some(prev) => (now - prev).as_secs_f64(),
            None => 0.0,
        };
        let mut output = self.kp * error;
        if dt > 0.0 {
            self.integral += error * dt;
            if self.ki > 0.0 {
                // anti-windup: the integral term may at most saturate the output
                let cap = self.kp * 20.0 / self.ki;
                self.integral = self.integral.clamp(-cap, cap);
            }
            let derivative = (error - self.previous_error) / dt;
            output += self.ki * self.integral + self.kd * derivative;
        }
        self.previous_error = error;
        self.previous_time = Some(now);
        // normalize against kp full-scale so a cold start saturates
        (output / (self.kp * 20.0)).clamp(0.0, 1.0)
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.previous_error = 0.0;
        self.previous_time = None;
    }
}

/// First-order thermal model standing in for a real thermistor read. The
/// body heats toward `ambient + gain * duty` with time constant `tau`.
#[derive(Debug, Clone)]
pub struct SimulatedThermistor {
    temperature: f64,
    ambient: f64,
    gain: f64,
    tau: f64,
    last_read: Option<Instant>,
}

impl SimulatedThermistor {
    pub fn new() -> Self {
        Self { temperature: 22.0, ambient: 22.0, gain: 280.0, tau: 18.0, last_read: None }
    }

    /// Read the sensor, advancing the model by the heater power applied
    /// since the previous read.
    pub fn read(&mut self, now: Instant, heater_duty: f64) -> f64 {
        if let Some(prev) = self.last_read {
            let dt = (now - prev).as_secs_f64();
            let equilibrium = self.ambient + self.gain * heater_duty;
            self.temperature += (equilibrium - self.temperature) * (dt / self.tau).min(1.0);
        }
        self.last_read = Some(now);
        self.temperature
    }
}

impl Default for SimulatedThermistor {
    fn default() -> Self {
        Self::new()
    }
}

//! Line-oriented text protocol spoken with the GPIO microcontroller.
//!
//! Every exchange is one request line followed by one response line, both
//! `\n`-terminated ASCII (a trailing `\r` is tolerated).
//!
//! | Request | Success response |
//! |---|---|
//! | `MOTOR_SPEED:<0..=255>` | `OK:MOTOR_SPEED:<n>` |
//! | `WDT_RESET` | `OK:WDT_RESET` |
//! | `GET_VIBRATION_LEVEL` | `VIBRATION:<float g>` |
//! | `PING` | `OK:PING` |
//!
//! Any request may instead be answered with `ERROR:<message>`.

use photon_types::PhotonError;

/// Requests the host sends to the GPIO peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioCommand {
    /// Set the smoothing-motor PWM duty (0 stops the motor).
    MotorSpeed(u8),
    /// Feed the hardware watchdog.
    WdtReset,
    /// Read the accelerometer vibration magnitude.
    GetVibrationLevel,
    Ping,
}

impl GpioCommand {
    /// Encode without the line terminator.
    pub fn encode(&self) -> String {
        match self {
            Self::MotorSpeed(pwm) => format!("MOTOR_SPEED:{pwm}"),
            Self::WdtReset => "WDT_RESET".to_string(),
            Self::GetVibrationLevel => "GET_VIBRATION_LEVEL".to_string(),
            Self::Ping => "PING".to_string(),
        }
    }

    /// Parse a request line (used by peers and test benches).
    pub fn parse(line: &str) -> Result<Self, PhotonError> {
        let line = line.trim_end_matches(['\r', '\n']);
        match line {
            "WDT_RESET" => Ok(Self::WdtReset),
            "GET_VIBRATION_LEVEL" => Ok(Self::GetVibrationLevel),
            "PING" => Ok(Self::Ping),
            _ => {
                if let Some(value) = line.strip_prefix("MOTOR_SPEED:") {
                    value
                        .parse::<u8>()
                        .map(Self::MotorSpeed)
                        .map_err(|e| PhotonError::Protocol(format!("bad motor speed {value:?}: {e}")))
                } else {
                    Err(PhotonError::Protocol(format!("unknown command {line:?}")))
                }
            }
        }
    }

    /// Whether `response` is the answer to this request (as opposed to a
    /// stale line left over from an earlier, timed-out exchange).
    pub fn accepts(&self, response: &GpioResponse) -> bool {
        match (self, response) {
            (_, GpioResponse::Error(_)) => true,
            (Self::GetVibrationLevel, GpioResponse::Vibration(_)) => true,
            (Self::GetVibrationLevel, GpioResponse::Ok(_)) => false,
            (_, GpioResponse::Ok(echo)) => *echo == self.encode(),
            (_, GpioResponse::Vibration(_)) => false,
        }
    }
}

/// Responses the GPIO peer sends back.
#[derive(Debug, Clone, PartialEq)]
pub enum GpioResponse {
    /// `OK:<echoed request>`
    Ok(String),
    /// `VIBRATION:<g>`
    Vibration(f32),
    /// `ERROR:<message>`
    Error(String),
}

impl GpioResponse {
    pub fn encode(&self) -> String {
        match self {
            Self::Ok(echo) => format!("OK:{echo}"),
            Self::Vibration(g) => format!("VIBRATION:{g}"),
            Self::Error(msg) => format!("ERROR:{msg}"),
        }
    }

    pub fn parse(line: &str) -> Result<Self, PhotonError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(echo) = line.strip_prefix("OK:") {
            Ok(Self::Ok(echo.to_string()))
        } else if let Some(value) = line.strip_prefix("VIBRATION:") {
            value
                .trim()
                .parse::<f32>()
                .map(Self::Vibration)
                .map_err(|e| PhotonError::Protocol(format!("bad vibration value {value:?}: {e}")))
        } else if let Some(msg) = line.strip_prefix("ERROR:") {
            Ok(Self::Error(msg.to_string()))
        } else {
            Err(PhotonError::Protocol(format!("unrecognised response {line:?}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_requests() {
        assert_eq!(GpioCommand::MotorSpeed(128).encode(), "MOTOR_SPEED:128");
        assert_eq!(GpioCommand::WdtReset.encode(), "WDT_RESET");
        assert_eq!(GpioCommand::GetVibrationLevel.encode(), "GET_VIBRATION_LEVEL");
    }

    #[test]
    fn parses_requests_with_crlf() {
        assert_eq!(
            GpioCommand::parse("MOTOR_SPEED:0\r\n").unwrap(),
            GpioCommand::MotorSpeed(0)
        );
        assert!(GpioCommand::parse("MOTOR_SPEED:300").is_err());
        assert!(GpioCommand::parse("LASER_ON").is_err());
    }

    #[test]
    fn parses_responses() {
        assert_eq!(
            GpioResponse::parse("OK:WDT_RESET\r").unwrap(),
            GpioResponse::Ok("WDT_RESET".into())
        );
        assert_eq!(
            GpioResponse::parse("VIBRATION:1.25").unwrap(),
            GpioResponse::Vibration(1.25)
        );
        assert_eq!(
            GpioResponse::parse("ERROR:motor driver fault").unwrap(),
            GpioResponse::Error("motor driver fault".into())
        );
        assert!(GpioResponse::parse("VIBRATION:lots").is_err());
        assert!(GpioResponse::parse("hello").is_err());
    }

    #[test]
    fn accepts_only_matching_echo() {
        let cmd = GpioCommand::MotorSpeed(90);
        assert!(cmd.accepts(&GpioResponse::Ok("MOTOR_SPEED:90".into())));
        assert!(!cmd.accepts(&GpioResponse::Ok("WDT_RESET".into())));
        assert!(!cmd.accepts(&GpioResponse::Vibration(0.3)));
        assert!(cmd.accepts(&GpioResponse::Error("busy".into())));

        let read = GpioCommand::GetVibrationLevel;
        assert!(read.accepts(&GpioResponse::Vibration(0.9)));
        assert!(!read.accepts(&GpioResponse::Ok("WDT_RESET".into())));
    }
}

use crate::domain::entities::exchange::Instrument;
use crate::domain::entities::position::{validate_levels, Direction};
use crate::domain::errors::EngineError;
use serde::{Deserialize, Serialize};

/// Entry signal produced by the strategy layer and consumed once by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub instrument: Instrument,
    pub direction: Direction,
    pub entry: f64,
    pub stop_loss: f64,
    pub target: f64,
    pub quantity: u32,
    pub confidence: f64,
    /// Skip discretionary screening. Only for controlled test injection.
    #[serde(default)]
    pub bypass_screening: bool,
}

impl Signal {
    pub fn symbol(&self) -> &str {
        &self.instrument.trading_symbol
    }

    /// Structural validation only; strategy logic is not second-guessed here.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.instrument.trading_symbol.trim().is_empty() {
            return Err(EngineError::InvalidSignal("symbol is empty".to_string()));
        }
        if self.instrument.token.trim().is_empty() {
            return Err(EngineError::InvalidSignal(format!(
                "instrument token is empty for {}",
                self.symbol()
            )));
        }
        if self.quantity == 0 {
            return Err(EngineError::InvalidSignal(format!(
                "quantity must be positive for {}",
                self.symbol()
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(EngineError::InvalidSignal(format!(
                "confidence {:.3} outside [0, 1] for {}",
                self.confidence,
                self.symbol()
            )));
        }
        validate_levels(
            self.symbol(),
            self.direction,
            self.entry,
            self.stop_loss,
            self.target,
        )
        .map_err(|e| EngineError::InvalidSignal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::exchange::Exchange;

    fn signal() -> Signal {
        Signal {
            id: "sig-1".to_string(),
            instrument: Instrument::new(Exchange::Nse, "1594", "INFY-EQ"),
            direction: Direction::Long,
            entry: 100.0,
            stop_loss: 98.0,
            target: 106.0,
            quantity: 10,
            confidence: 0.8,
            bypass_screening: false,
        }
    }

    #[test]
    fn test_valid_signal() {
        assert!(signal().validate().is_ok());
        assert_eq!(signal().symbol(), "INFY-EQ");
    }

    #[test]
    fn test_signal_with_bad_levels_rejected() {
        let mut s = signal();
        s.direction = Direction::Short;
        assert!(matches!(s.validate(), Err(EngineError::InvalidSignal(_))));
    }

    #[test]
    fn test_signal_structural_fields() {
        let mut s = signal();
        s.quantity = 0;
        assert!(s.validate().is_err());

        let mut s = signal();
        s.instrument.trading_symbol = " ".to_string();
        assert!(s.validate().is_err());

        let mut s = signal();
        s.confidence = 1.5;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_bypass_flag_defaults_to_false() {
        let json = r#"{
            "id": "sig-2",
            "instrument": {"exchange": "NSE", "token": "1594", "trading_symbol": "INFY-EQ"},
            "direction": "long",
            "entry": 100.0, "stop_loss": 98.0, "target": 106.0,
            "quantity": 1, "confidence": 0.9
        }"#;
        let parsed: Signal = serde_json::from_str(json).unwrap();
        assert!(!parsed.bypass_screening);
        assert!(parsed.validate().is_ok());
    }
}

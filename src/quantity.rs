use std::fmt;

/// Physical quantities read from the meter or received from the message feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QuantityName {
    Voltage,
    Current,
    ActivePower,
    PowerFactor,
    Frequency,
    ImportEnergy,
    ExportEnergy,
    TotalActiveEnergy,
}

impl QuantityName {
    pub const ALL: [QuantityName; 8] = [
        QuantityName::Voltage,
        QuantityName::Current,
        QuantityName::ActivePower,
        QuantityName::PowerFactor,
        QuantityName::Frequency,
        QuantityName::ImportEnergy,
        QuantityName::ExportEnergy,
        QuantityName::TotalActiveEnergy,
    ];

    /// Number of decimals a value is rounded to before it is published.
    pub fn precision(self) -> u32 {
        match self {
            QuantityName::Voltage => 2,
            QuantityName::Current => 1,
            QuantityName::ActivePower => 0,
            QuantityName::PowerFactor => 2,
            QuantityName::Frequency => 4,
            QuantityName::ImportEnergy
            | QuantityName::ExportEnergy
            | QuantityName::TotalActiveEnergy => 2,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for QuantityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QuantityName::Voltage => "voltage",
            QuantityName::Current => "current",
            QuantityName::ActivePower => "active power",
            QuantityName::PowerFactor => "power factor",
            QuantityName::Frequency => "frequency",
            QuantityName::ImportEnergy => "import energy",
            QuantityName::ExportEnergy => "export energy",
            QuantityName::TotalActiveEnergy => "total active energy",
        };
        f.write_str(name)
    }
}

/// Rounds `value` to `decimals` places, half away from zero.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(decimals as i32);
    (value * scale).round() / scale
}

/// Decoded quantities for one observation instant.
///
/// A quantity is `None` when its read failed or the source does not provide it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QuantitySnapshot {
    values: [Option<f64>; 8],
}

impl QuantitySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: QuantityName) -> Option<f64> {
        self.values[name.index()]
    }

    pub fn set(&mut self, name: QuantityName, value: Option<f64>) {
        self.values[name.index()] = value;
    }

    pub fn with(mut self, name: QuantityName, value: f64) -> Self {
        self.set(name, Some(value));
        self
    }

    /// True when every quantity in `required` is present.
    pub fn is_complete(&self, required: &[QuantityName]) -> bool {
        required.iter().all(|name| self.get(*name).is_some())
    }

    pub fn present_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }

    /// Adds `offset` to the import energy figure if it was read.
    pub fn apply_import_offset(mut self, offset: f64) -> Self {
        if let Some(import) = self.get(QuantityName::ImportEnergy) {
            self.set(QuantityName::ImportEnergy, Some(import + offset));
        }
        self
    }

    /// Returns a copy with every present value rounded to its publish precision.
    pub fn rounded(&self) -> Self {
        let mut out = *self;
        for name in QuantityName::ALL {
            out.set(name, self.get(name).map(|v| round_to(v, name.precision())));
        }
        out
    }
}

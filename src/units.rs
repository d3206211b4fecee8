//! Unit tags, unit-tagged values and conversion utilities.
//!
//! Units are opaque symbols ([`UnitTag`]) resolved through a [`UnitRegistry`]
//! into a physical [`Dimension`] plus an affine factor to that dimension's
//! base unit. Symbols the registry does not know are only compatible with
//! themselves. [`UnitPreferences`] picks display units per dimension
//! (metric, imperial, etc.).

use std::collections::HashMap;
use std::fmt;
use std::ops::{Div, Mul, Neg};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::error::IncompatibleUnitError;

// ============================================================================
// Unit tags and dimensions
// ============================================================================

/// Opaque unit symbol as logged by the source (e.g. `"°C"`, `"kPa"`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitTag(String);

impl UnitTag {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    /// The empty tag used for unitless channels (counts, gears, flags).
    pub fn dimensionless() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_dimensionless(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for UnitTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for UnitTag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UnitTag {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UnitTag {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Physical dimension of a unit.
#[derive(AsRefStr, Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Hash, Serialize)]
pub enum Dimension {
    Temperature,
    Pressure,
    Speed,
    Length,
    Volume,
    Flow,
    Acceleration,
    Time,
    Voltage,
    Current,
    Frequency,
    Angle,
    AngularVelocity,
    RotationalSpeed,
    Mass,
    Ratio,
}

/// How a unit maps onto its dimension's base unit: `base = value * scale + offset`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UnitDef {
    pub dimension: Dimension,
    pub scale: f64,
    pub offset: f64,
}

impl UnitDef {
    pub const fn linear(dimension: Dimension, scale: f64) -> Self {
        Self {
            dimension,
            scale,
            offset: 0.0,
        }
    }

    pub const fn affine(dimension: Dimension, scale: f64, offset: f64) -> Self {
        Self {
            dimension,
            scale,
            offset,
        }
    }
}

/// Precomputed affine conversion between two compatible units.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UnitConverter {
    scale: f64,
    offset: f64,
}

impl UnitConverter {
    pub const IDENTITY: UnitConverter = UnitConverter {
        scale: 1.0,
        offset: 0.0,
    };

    pub fn apply(&self, value: f64) -> f64 {
        value * self.scale + self.offset
    }

    /// Whether the conversion reverses ordering (min and max swap).
    pub fn is_decreasing(&self) -> bool {
        self.scale < 0.0
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Maps unit symbols to dimensions and conversion factors.
#[derive(Clone, Debug, Default)]
pub struct UnitRegistry {
    units: HashMap<String, UnitDef>,
}

impl UnitRegistry {
    /// A registry with no units; every tag is opaque.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry with the built-in unit table.
    pub fn builtin() -> Self {
        use Dimension::*;

        let mut registry = Self::empty();
        let table: &[(&str, UnitDef)] = &[
            // Temperature (base K)
            ("K", UnitDef::linear(Temperature, 1.0)),
            ("°C", UnitDef::affine(Temperature, 1.0, 273.15)),
            ("degC", UnitDef::affine(Temperature, 1.0, 273.15)),
            ("°F", UnitDef::affine(Temperature, 5.0 / 9.0, 273.15 - 32.0 * 5.0 / 9.0)),
            ("degF", UnitDef::affine(Temperature, 5.0 / 9.0, 273.15 - 32.0 * 5.0 / 9.0)),
            // Pressure (base kPa)
            ("kPa", UnitDef::linear(Pressure, 1.0)),
            ("Pa", UnitDef::linear(Pressure, 0.001)),
            ("mbar", UnitDef::linear(Pressure, 0.1)),
            ("bar", UnitDef::linear(Pressure, 100.0)),
            ("PSI", UnitDef::linear(Pressure, 6.894_757_293_168)),
            ("psi", UnitDef::linear(Pressure, 6.894_757_293_168)),
            // Speed (base km/h)
            ("km/h", UnitDef::linear(Speed, 1.0)),
            ("m/s", UnitDef::linear(Speed, 3.6)),
            ("mph", UnitDef::linear(Speed, 1.609_344)),
            // Length (base m)
            ("m", UnitDef::linear(Length, 1.0)),
            ("mm", UnitDef::linear(Length, 0.001)),
            ("cm", UnitDef::linear(Length, 0.01)),
            ("km", UnitDef::linear(Length, 1000.0)),
            ("mi", UnitDef::linear(Length, 1609.344)),
            ("ft", UnitDef::linear(Length, 0.3048)),
            ("in", UnitDef::linear(Length, 0.0254)),
            // Volume (base L)
            ("L", UnitDef::linear(Volume, 1.0)),
            ("mL", UnitDef::linear(Volume, 0.001)),
            ("cc", UnitDef::linear(Volume, 0.001)),
            ("gal", UnitDef::linear(Volume, 3.785_411_784)),
            // Flow (base cc/min)
            ("cc/min", UnitDef::linear(Flow, 1.0)),
            ("L/min", UnitDef::linear(Flow, 1000.0)),
            ("L/h", UnitDef::linear(Flow, 1000.0 / 60.0)),
            // Acceleration (base m/s²)
            ("m/s²", UnitDef::linear(Acceleration, 1.0)),
            ("m/s^2", UnitDef::linear(Acceleration, 1.0)),
            ("g", UnitDef::linear(Acceleration, 9.80665)),
            // Time (base s)
            ("s", UnitDef::linear(Time, 1.0)),
            ("ms", UnitDef::linear(Time, 1e-3)),
            ("μs", UnitDef::linear(Time, 1e-6)),
            ("us", UnitDef::linear(Time, 1e-6)),
            ("min", UnitDef::linear(Time, 60.0)),
            ("h", UnitDef::linear(Time, 3600.0)),
            // Electrical
            ("V", UnitDef::linear(Voltage, 1.0)),
            ("mV", UnitDef::linear(Voltage, 1e-3)),
            ("A", UnitDef::linear(Current, 1.0)),
            ("mA", UnitDef::linear(Current, 1e-3)),
            ("μA", UnitDef::linear(Current, 1e-6)),
            ("uA", UnitDef::linear(Current, 1e-6)),
            ("Hz", UnitDef::linear(Frequency, 1.0)),
            ("kHz", UnitDef::linear(Frequency, 1000.0)),
            // Rotation
            ("°", UnitDef::linear(Angle, 1.0)),
            ("deg", UnitDef::linear(Angle, 1.0)),
            ("rad", UnitDef::linear(Angle, 180.0 / std::f64::consts::PI)),
            ("°/s", UnitDef::linear(AngularVelocity, 1.0)),
            ("rad/s", UnitDef::linear(AngularVelocity, 180.0 / std::f64::consts::PI)),
            ("RPM", UnitDef::linear(RotationalSpeed, 1.0)),
            ("rpm", UnitDef::linear(RotationalSpeed, 1.0)),
            // Mass (base g); "g" is taken by acceleration
            ("kg", UnitDef::linear(Mass, 1000.0)),
            ("mg", UnitDef::linear(Mass, 0.001)),
            ("gram", UnitDef::linear(Mass, 1.0)),
            // Ratio
            ("%", UnitDef::linear(Ratio, 1.0)),
        ];
        for (symbol, def) in table {
            registry.register(*symbol, *def);
        }
        registry
    }

    /// Shared built-in registry.
    pub fn standard() -> &'static UnitRegistry {
        static STANDARD: OnceLock<UnitRegistry> = OnceLock::new();
        STANDARD.get_or_init(UnitRegistry::builtin)
    }

    /// Add or replace a unit definition.
    pub fn register(&mut self, symbol: impl Into<String>, def: UnitDef) {
        self.units.insert(symbol.into(), def);
    }

    pub fn resolve(&self, unit: &UnitTag) -> Option<UnitDef> {
        self.units.get(unit.as_str()).copied()
    }

    pub fn dimension(&self, unit: &UnitTag) -> Option<Dimension> {
        self.resolve(unit).map(|def| def.dimension)
    }

    /// Whether values in `a` can be expressed in `b`.
    pub fn compatible(&self, a: &UnitTag, b: &UnitTag) -> bool {
        if a == b {
            return true;
        }
        match (self.resolve(a), self.resolve(b)) {
            (Some(a), Some(b)) => a.dimension == b.dimension,
            _ => false,
        }
    }

    /// Build the affine conversion from `from` to `to`.
    pub fn converter(&self, from: &UnitTag, to: &UnitTag) -> Result<UnitConverter, IncompatibleUnitError> {
        if from == to {
            return Ok(UnitConverter::IDENTITY);
        }
        match (self.resolve(from), self.resolve(to)) {
            (Some(src), Some(dst)) if src.dimension == dst.dimension => Ok(UnitConverter {
                scale: src.scale / dst.scale,
                offset: (src.offset - dst.offset) / dst.scale,
            }),
            _ => Err(IncompatibleUnitError {
                from: from.clone(),
                to: to.clone(),
            }),
        }
    }

    pub fn convert(&self, value: f64, from: &UnitTag, to: &UnitTag) -> Result<f64, IncompatibleUnitError> {
        Ok(self.converter(from, to)?.apply(value))
    }
}

// ============================================================================
// Unit-tagged values
// ============================================================================

/// A magnitude tagged with its unit. Pure value type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnitValue {
    pub magnitude: f64,
    pub unit: UnitTag,
}

impl UnitValue {
    pub fn new(magnitude: f64, unit: impl Into<UnitTag>) -> Self {
        Self {
            magnitude,
            unit: unit.into(),
        }
    }

    /// Convert using the standard registry.
    pub fn convert_to(&self, target: &UnitTag) -> Result<UnitValue, IncompatibleUnitError> {
        self.convert_to_in(target, UnitRegistry::standard())
    }

    pub fn convert_to_in(
        &self,
        target: &UnitTag,
        registry: &UnitRegistry,
    ) -> Result<UnitValue, IncompatibleUnitError> {
        let magnitude = registry.convert(self.magnitude, &self.unit, target)?;
        Ok(UnitValue {
            magnitude,
            unit: target.clone(),
        })
    }

    pub fn compatible_with(&self, other: &UnitTag) -> bool {
        UnitRegistry::standard().compatible(&self.unit, other)
    }

    /// Sum expressed in `self`'s unit.
    pub fn try_add(&self, other: &UnitValue) -> Result<UnitValue, IncompatibleUnitError> {
        let other = other.convert_to(&self.unit)?;
        Ok(UnitValue::new(self.magnitude + other.magnitude, self.unit.clone()))
    }

    /// Difference expressed in `self`'s unit.
    pub fn try_sub(&self, other: &UnitValue) -> Result<UnitValue, IncompatibleUnitError> {
        let other = other.convert_to(&self.unit)?;
        Ok(UnitValue::new(self.magnitude - other.magnitude, self.unit.clone()))
    }
}

impl Mul<f64> for UnitValue {
    type Output = UnitValue;

    fn mul(self, rhs: f64) -> UnitValue {
        UnitValue::new(self.magnitude * rhs, self.unit)
    }
}

impl Div<f64> for UnitValue {
    type Output = UnitValue;

    fn div(self, rhs: f64) -> UnitValue {
        UnitValue::new(self.magnitude / rhs, self.unit)
    }
}

impl Neg for UnitValue {
    type Output = UnitValue;

    fn neg(self) -> UnitValue {
        UnitValue::new(-self.magnitude, self.unit)
    }
}

impl fmt::Display for UnitValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.unit.is_dimensionless() {
            write!(f, "{:.2}", self.magnitude)
        } else {
            write!(f, "{:.2} {}", self.magnitude, self.unit)
        }
    }
}

// ============================================================================
// Display preferences
// ============================================================================

/// Temperature unit preference
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum TemperatureUnit {
    Kelvin,
    #[default]
    Celsius,
    Fahrenheit,
}

impl TemperatureUnit {
    pub fn symbol(&self) -> &'static str {
        match self {
            TemperatureUnit::Kelvin => "K",
            TemperatureUnit::Celsius => "°C",
            TemperatureUnit::Fahrenheit => "°F",
        }
    }
}

/// Pressure unit preference
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum PressureUnit {
    #[default]
    KPa,
    PSI,
    Bar,
}

impl PressureUnit {
    pub fn symbol(&self) -> &'static str {
        match self {
            PressureUnit::KPa => "kPa",
            PressureUnit::PSI => "PSI",
            PressureUnit::Bar => "bar",
        }
    }
}

/// Speed unit preference
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum SpeedUnit {
    #[default]
    KmH,
    Mph,
}

impl SpeedUnit {
    pub fn symbol(&self) -> &'static str {
        match self {
            SpeedUnit::KmH => "km/h",
            SpeedUnit::Mph => "mph",
        }
    }
}

/// Distance unit preference
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum DistanceUnit {
    #[default]
    Kilometers,
    Miles,
}

impl DistanceUnit {
    pub fn symbol(&self) -> &'static str {
        match self {
            DistanceUnit::Kilometers => "km",
            DistanceUnit::Miles => "mi",
        }
    }
}

/// Volume unit preference
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum VolumeUnit {
    #[default]
    Liters,
    Gallons,
}

impl VolumeUnit {
    pub fn symbol(&self) -> &'static str {
        match self {
            VolumeUnit::Liters => "L",
            VolumeUnit::Gallons => "gal",
        }
    }
}

/// Flow rate unit preference
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum FlowUnit {
    #[default]
    CcPerMin,
    LPerMin,
}

impl FlowUnit {
    pub fn symbol(&self) -> &'static str {
        match self {
            FlowUnit::CcPerMin => "cc/min",
            FlowUnit::LPerMin => "L/min",
        }
    }
}

/// Acceleration unit preference
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum AccelerationUnit {
    #[default]
    MPerS2,
    G,
}

impl AccelerationUnit {
    pub fn symbol(&self) -> &'static str {
        match self {
            AccelerationUnit::MPerS2 => "m/s²",
            AccelerationUnit::G => "g",
        }
    }
}

/// User preferences for display units
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitPreferences {
    pub temperature: TemperatureUnit,
    pub pressure: PressureUnit,
    pub speed: SpeedUnit,
    pub distance: DistanceUnit,
    pub volume: VolumeUnit,
    pub flow: FlowUnit,
    pub acceleration: AccelerationUnit,
}

impl UnitPreferences {
    /// Preferred display unit for a channel logged in `native`.
    ///
    /// Returns `None` when the preference is the native unit already or the
    /// dimension has no preference.
    pub fn preferred_unit(&self, native: &UnitTag, registry: &UnitRegistry) -> Option<UnitTag> {
        let symbol = match registry.dimension(native)? {
            Dimension::Temperature => self.temperature.symbol(),
            Dimension::Pressure => self.pressure.symbol(),
            Dimension::Speed => self.speed.symbol(),
            // Only long distances follow the preference; mm/cm stay as logged
            Dimension::Length if matches!(native.as_str(), "km" | "mi") => self.distance.symbol(),
            Dimension::Volume => self.volume.symbol(),
            Dimension::Flow => self.flow.symbol(),
            Dimension::Acceleration => self.acceleration.symbol(),
            _ => return None,
        };
        (symbol != native.as_str()).then(|| UnitTag::from(symbol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9 * b.abs().max(1.0)
    }

    #[test]
    fn test_temperature_conversions() {
        let boiling = UnitValue::new(100.0, "°C");
        assert!(approx(boiling.convert_to(&"K".into()).unwrap().magnitude, 373.15));
        assert!(approx(boiling.convert_to(&"°F".into()).unwrap().magnitude, 212.0));

        let body = UnitValue::new(98.6, "°F");
        assert!(approx(body.convert_to(&"°C".into()).unwrap().magnitude, 37.0));
    }

    #[test]
    fn test_linear_conversions() {
        let registry = UnitRegistry::standard();
        assert!(approx(registry.convert(1.0, &"bar".into(), &"kPa".into()).unwrap(), 100.0));
        assert!(approx(registry.convert(100.0, &"km/h".into(), &"mph".into()).unwrap(), 62.137_119_223_733_4));
        assert!(approx(registry.convert(1.0, &"g".into(), &"m/s²".into()).unwrap(), 9.80665));
        assert!(approx(registry.convert(250.0, &"ms".into(), &"s".into()).unwrap(), 0.25));
    }

    #[test]
    fn test_round_trip_returns_original() {
        let pairs = [("°C", "°F"), ("kPa", "PSI"), ("km", "mi"), ("L", "gal"), ("rad", "°")];
        for (from, to) in pairs {
            for magnitude in [-40.0, 0.0, 1.5, 1234.5678] {
                let value = UnitValue::new(magnitude, from);
                let back = value
                    .convert_to(&to.into())
                    .and_then(|v| v.convert_to(&from.into()))
                    .unwrap();
                assert!(
                    approx(back.magnitude, magnitude),
                    "{} {} -> {} -> {}",
                    magnitude,
                    from,
                    to,
                    back.magnitude
                );
                assert_eq!(back.unit.as_str(), from);
            }
        }
    }

    #[test]
    fn test_incompatible_units() {
        let temp = UnitValue::new(20.0, "°C");
        let err = temp.convert_to(&"m".into()).unwrap_err();
        assert_eq!(err.from.as_str(), "°C");
        assert_eq!(err.to.as_str(), "m");
        assert!(!temp.compatible_with(&"m".into()));
        assert!(temp.compatible_with(&"K".into()));
    }

    #[test]
    fn test_unknown_units_are_opaque() {
        let value = UnitValue::new(3.0, "counts");
        assert!(value.compatible_with(&"counts".into()));
        assert!(!value.compatible_with(&"%".into()));
        assert_eq!(value.convert_to(&"counts".into()).unwrap(), value);
    }

    #[test]
    fn test_arithmetic() {
        let a = UnitValue::new(1.0, "km");
        let b = UnitValue::new(500.0, "m");
        let sum = a.try_add(&b).unwrap();
        assert!(approx(sum.magnitude, 1.5));
        assert_eq!(sum.unit.as_str(), "km");
        assert!(approx(a.try_sub(&b).unwrap().magnitude, 0.5));
        assert!(a.try_add(&UnitValue::new(1.0, "s")).is_err());

        let scaled = UnitValue::new(2.0, "V") * 3.0;
        assert_eq!(scaled, UnitValue::new(6.0, "V"));
        assert_eq!(-(scaled / 2.0), UnitValue::new(-3.0, "V"));
    }

    #[test]
    fn test_preferred_units() {
        let registry = UnitRegistry::standard();
        let prefs = UnitPreferences {
            temperature: TemperatureUnit::Fahrenheit,
            pressure: PressureUnit::KPa,
            ..Default::default()
        };
        assert_eq!(prefs.preferred_unit(&"K".into(), registry), Some("°F".into()));
        assert_eq!(prefs.preferred_unit(&"kPa".into(), registry), None);
        assert_eq!(prefs.preferred_unit(&"bar".into(), registry), Some("kPa".into()));
        assert_eq!(prefs.preferred_unit(&"mm".into(), registry), None);
        assert_eq!(prefs.preferred_unit(&"RPM".into(), registry), None);
    }

    #[test]
    fn test_converter_direction() {
        let registry = UnitRegistry::standard();
        let conv = registry.converter(&"°C".into(), &"°F".into()).unwrap();
        assert!(!conv.is_decreasing());
        assert!(!conv.is_identity());
        assert!(registry.converter(&"x".into(), &"x".into()).unwrap().is_identity());
    }
}

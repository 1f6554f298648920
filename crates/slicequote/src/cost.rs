//! Print cost estimation.
//!
//! Cost = printer wear (depreciation) + electricity, both per printing hour,
//! plus the price of the filament used.

use serde::Serialize;

use crate::archive::FilamentUsage;
use crate::settings::Pricing;

/// A consumable printer part.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepreciationItem {
    /// Part name.
    pub name: &'static str,
    /// Replacement price.
    pub price: f64,
    /// Lifespan; the rate is `price / lifespan` per printing hour.
    pub lifespan: f64,
}

const fn part(name: &'static str, price: f64, lifespan: f64) -> DepreciationItem {
    DepreciationItem {
        name,
        price,
        lifespan,
    }
}

/// Wear parts of a typical FDM printer.
///
/// Lifespans are labelled in minutes but divide a per-hour rate. The LCD
/// lifespan is `5 * 365 * 24`, five years counted in hours, unlike the rest.
/// Both are kept as deployed so quotes stay comparable.
pub const DEPRECIATION_TABLE: &[DepreciationItem] = &[
    part("Nozzle", 10.0, 300.0),
    part("PTFE Tube (Hotend Liner)", 5.0, 500.0),
    part("Extruder Gears", 20.0, 1000.0),
    part("Build Plate Surface", 30.0, 500.0),
    part("Cooling Fans", 15.0, 2000.0),
    part("Belts", 10.0, 2000.0),
    part("Linear Bearings and Rods", 40.0, 3000.0),
    part("Hotend Heater Cartridge", 15.0, 2000.0),
    part("Thermistor", 10.0, 2000.0),
    part("Drive Gears/Pulleys", 25.0, 3000.0),
    part("Motherboard", 150.0, 5000.0),
    part("Stepper Driver", 20.0, 5000.0),
    part("LCD Screen", 60.0, 5.0 * 365.0 * 24.0),
    part("Power Supply Unit (PSU)", 80.0, 5000.0),
    part("Stepper Motors", 30.0, 10000.0),
    part("Filament Sensor", 15.0, 3000.0),
    part("Print Bed Heating Element", 50.0, 5000.0),
];

/// Round to `places` decimals based on the exact binary value.
///
/// `0.0075` is stored slightly below the midpoint, so it rounds to `0.007`.
pub fn round_to(value: f64, places: usize) -> f64 {
    format!("{value:.places$}").parse().unwrap_or(value)
}

/// Filament geometry used to turn a length into a mass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilamentSpec {
    /// Diameter (cm).
    pub diameter_cm: f64,
    /// Density (g/cm³).
    pub density: f64,
}

impl Default for FilamentSpec {
    /// 1.75 mm PLA.
    fn default() -> Self {
        Self {
            diameter_cm: 0.175,
            density: 1.24,
        }
    }
}

impl FilamentSpec {
    /// Cross-section area (cm²).
    pub fn cross_section_cm2(&self) -> f64 {
        let radius = self.diameter_cm / 2.0;
        std::f64::consts::PI * radius * radius
    }

    /// Mass (g) of `meters` of filament.
    pub fn grams_from_length(&self, meters: f64) -> f64 {
        meters * 100.0 * self.cross_section_cm2() * self.density
    }
}

/// Itemised cost of one print.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CostBreakdown {
    /// Printer wear.
    pub depreciation_cost: f64,
    /// Electricity.
    pub electricity_cost: f64,
    /// Filament.
    pub filament_cost: f64,
    /// Sum of the three.
    pub total_cost: f64,
}

/// Rates and constants behind a quote.
#[derive(Debug, Clone)]
pub struct CostModel {
    /// Wear parts.
    pub parts: Vec<DepreciationItem>,
    /// Average printer power draw (W).
    pub power_watts: f64,
    /// Electricity price per kWh.
    pub rate_per_kwh: f64,
    /// Filament used for the length fallback.
    pub filament: FilamentSpec,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            parts: DEPRECIATION_TABLE.to_vec(),
            power_watts: 105.0,
            rate_per_kwh: 0.06,
            filament: FilamentSpec::default(),
        }
    }
}

impl CostModel {
    /// Sum of per-part wear rates, each rounded to 3 decimals.
    pub fn depreciation_rate_per_hour(&self) -> f64 {
        self.parts
            .iter()
            .map(|p| round_to(p.price / p.lifespan, 3))
            .sum()
    }

    /// Electricity cost of one printing hour, rounded to 3 decimals.
    pub fn electricity_rate_per_hour(&self) -> f64 {
        round_to(self.power_watts / 1000.0 * self.rate_per_kwh, 3)
    }

    /// Filament mass, derived from length when the slicer reported no mass.
    ///
    /// Some slicer builds do not resolve filament density inheritance and
    /// report `used_g="0"`; the length is still right.
    pub fn filament_grams(&self, usage: &FilamentUsage) -> f64 {
        let grams = usage.used_g.unwrap_or(0.0);
        match usage.used_m {
            Some(meters) if grams == 0.0 => {
                let derived = self.filament.grams_from_length(meters);
                tracing::info!(
                    meters,
                    cross_section_cm2 = self.filament.cross_section_cm2(),
                    density = self.filament.density,
                    grams = derived,
                    "Calculated used_g from used_m"
                );
                derived
            }
            _ => grams,
        }
    }

    /// Cost of printing for `hours` using `filament_grams` of filament.
    pub fn estimate(&self, hours: f64, filament_grams: f64, pricing: &Pricing) -> CostBreakdown {
        let depreciation_cost = hours * self.depreciation_rate_per_hour();
        let electricity_cost = hours * self.electricity_rate_per_hour();
        let filament_cost = filament_cost(pricing, filament_grams);
        CostBreakdown {
            depreciation_cost,
            electricity_cost,
            filament_cost,
            total_cost: depreciation_cost + electricity_cost + filament_cost,
        }
    }
}

/// `price / spool_weight * grams`, rounded to 2 decimals.
pub fn filament_cost(pricing: &Pricing, grams: f64) -> f64 {
    round_to(
        pricing.filament_price_per_spool / pricing.spool_weight_grams * grams,
        2,
    )
}

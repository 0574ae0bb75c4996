//! Register maps of the device families supported out of the box.

use std::collections::HashMap;

use serde::Deserialize;

use crate::block::Block;
use crate::decoder::{FieldMap, FieldSpec};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    /// Renogy smart lithium battery module.
    RenogyBattery,
    /// Renogy Rover/Wanderer MPPT charge controller.
    RenogySolarController,
}

impl Family {
    pub fn blocks(self) -> Result<Vec<Block>> {
        match self {
            Family::RenogyBattery => renogy_battery(),
            Family::RenogySolarController => renogy_solar_controller(),
        }
    }

    /// Factors turning raw register values into physical units.
    pub fn scales(self) -> HashMap<String, f64> {
        let scales: Vec<(String, f64)> = match self {
            Family::RenogyBattery => (1..=16)
                .flat_map(|cell| {
                    [
                        (format!("cell{cell:02}Voltage"), 0.1),
                        (format!("cell{cell:02}Temp"), 0.1),
                    ]
                })
                .chain(
                    [
                        ("bmsTemp", 0.1),
                        ("env01Temp", 0.1),
                        ("env02Temp", 0.1),
                        ("heater01Temp", 0.1),
                        ("heater02Temp", 0.1),
                        ("amperage", 0.01),
                        ("voltage", 0.1),
                        ("energyRemaining", 0.001),
                        ("energyCapacity", 0.001),
                        ("chargeVoltageLimit", 0.1),
                        ("dischargeVoltageLimit", 0.1),
                        ("chargeCurrentLimit", 0.01),
                        ("dischargeCurrentLimit", 0.01),
                    ]
                    .map(|(name, scale)| (name.to_owned(), scale)),
                )
                .collect(),
            Family::RenogySolarController => [
                ("battery_voltage", 0.1),
                ("charging_amperage", 0.01),
                ("load_voltage", 0.1),
                ("load_amperage", 0.01),
                ("solar_voltage", 0.1),
                ("solar_amperage", 0.01),
                // reported as a negative percentage
                ("street_light_brightness", -1.0),
            ]
            .map(|(name, scale)| (name.to_owned(), scale))
            .into_iter()
            .collect(),
        };
        scales.into_iter().collect()
    }
}

fn fields(entries: impl IntoIterator<Item = (String, FieldSpec)>) -> FieldMap {
    entries.into_iter().collect()
}

fn named<const N: usize>(entries: [(&str, FieldSpec); N]) -> FieldMap {
    fields(entries.map(|(name, spec)| (name.to_owned(), spec)))
}

fn renogy_battery() -> Result<Vec<Block>> {
    let cells = (1..=16_u16).flat_map(|cell| {
        [
            (
                format!("cell{cell:02}Voltage"),
                FieldSpec::U16 {
                    register: 5000 + cell,
                },
            ),
            (
                format!("cell{cell:02}Temp"),
                FieldSpec::I16 {
                    register: 5017 + cell,
                },
            ),
        ]
    });
    let counts = named([
        ("cellVoltageCount", FieldSpec::U16 { register: 5000 }),
        ("cellTempCount", FieldSpec::U16 { register: 5017 }),
    ]);

    Ok(vec![
        Block::new(
            "cell_voltages_and_temperatures",
            5000,
            5034,
            fields(counts.into_iter().chain(cells)),
        )?,
        Block::new(
            "pack",
            5035,
            5053,
            named([
                ("bmsTemp", FieldSpec::I16 { register: 5035 }),
                ("envTempCount", FieldSpec::U16 { register: 5036 }),
                ("env01Temp", FieldSpec::I16 { register: 5037 }),
                ("env02Temp", FieldSpec::I16 { register: 5038 }),
                ("heaterTempCount", FieldSpec::U16 { register: 5039 }),
                ("heater01Temp", FieldSpec::I16 { register: 5040 }),
                ("heater02Temp", FieldSpec::I16 { register: 5041 }),
                ("amperage", FieldSpec::I16 { register: 5042 }),
                ("voltage", FieldSpec::U16 { register: 5043 }),
                ("energyRemaining", FieldSpec::U32 { register: 5044 }),
                ("energyCapacity", FieldSpec::U32 { register: 5046 }),
                ("cycleNumber", FieldSpec::U16 { register: 5048 }),
                ("chargeVoltageLimit", FieldSpec::U16 { register: 5049 }),
                ("dischargeVoltageLimit", FieldSpec::U16 { register: 5050 }),
                ("chargeCurrentLimit", FieldSpec::I16 { register: 5051 }),
                ("dischargeCurrentLimit", FieldSpec::I16 { register: 5052 }),
            ]),
        )?,
        Block::new(
            "status_and_properties",
            5100,
            5142,
            named([
                ("alarminfoCellVoltage", FieldSpec::U32 { register: 5100 }),
                ("alarminfoCellTemperature", FieldSpec::U32 { register: 5102 }),
                ("alarminfoOther", FieldSpec::U32 { register: 5104 }),
                ("status1", FieldSpec::U16 { register: 5106 }),
                ("status2", FieldSpec::U16 { register: 5107 }),
                ("status3", FieldSpec::U16 { register: 5108 }),
                ("statusChargeDischarge", FieldSpec::U16 { register: 5109 }),
                ("serial", FieldSpec::Ascii { register: 5110, length: 8 }),
                ("manufacturerVersion", FieldSpec::Ascii { register: 5118, length: 1 }),
                ("mainlineVersion", FieldSpec::Ascii { register: 5119, length: 2 }),
                ("communicationProtocolVersion", FieldSpec::Ascii { register: 5121, length: 1 }),
                ("model", FieldSpec::Ascii { register: 5122, length: 8 }),
                ("softwareVersion", FieldSpec::Ascii { register: 5130, length: 2 }),
                ("manufacturerName", FieldSpec::Ascii { register: 5132, length: 10 }),
            ]),
        )?,
    ])
}

fn renogy_solar_controller() -> Result<Vec<Block>> {
    Ok(vec![
        Block::new(
            "identity",
            10,
            32,
            named([
                ("system_voltage", FieldSpec::HighByte { register: 10, signed: false }),
                ("rated_charge_amperage", FieldSpec::LowByte { register: 10, signed: false }),
                ("rated_discharge_amperage", FieldSpec::HighByte { register: 11, signed: false }),
                ("product_type", FieldSpec::LowByte { register: 11, signed: false }),
                ("model", FieldSpec::Ascii { register: 12, length: 8 }),
                ("software_version", FieldSpec::U32 { register: 20 }),
                ("hardware_version", FieldSpec::U32 { register: 22 }),
                ("serial", FieldSpec::U32 { register: 24 }),
                ("address", FieldSpec::U16 { register: 26 }),
                ("protocol_version", FieldSpec::U32 { register: 27 }),
                ("unique_id_code", FieldSpec::U32 { register: 29 }),
            ]),
        )?,
        Block::new(
            "live",
            256,
            266,
            named([
                ("battery_soc", FieldSpec::U16 { register: 256 }),
                ("battery_voltage", FieldSpec::U16 { register: 257 }),
                ("charging_amperage", FieldSpec::U16 { register: 258 }),
                ("controller_temperature", FieldSpec::HighByte { register: 259, signed: true }),
                ("battery_temperature", FieldSpec::LowByte { register: 259, signed: true }),
                ("load_voltage", FieldSpec::U16 { register: 260 }),
                ("load_amperage", FieldSpec::U16 { register: 261 }),
                ("load_wattage", FieldSpec::U16 { register: 262 }),
                ("solar_voltage", FieldSpec::U16 { register: 263 }),
                ("solar_amperage", FieldSpec::U16 { register: 264 }),
                ("solar_wattage", FieldSpec::U16 { register: 265 }),
            ]),
        )?,
        Block::new(
            "charging_state",
            288,
            292,
            named([
                ("street_light_brightness", FieldSpec::HighByte { register: 288, signed: true }),
                ("charging_status", FieldSpec::LowByte { register: 288, signed: false }),
                ("alarm", FieldSpec::U32 { register: 289 }),
            ]),
        )?,
    ])
}

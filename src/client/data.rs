//! Acquisition status and data reads
//!
//! `GetAcquisitionData` indexes energy samples, not individual values: one
//! sample carries `ValuesPerSample` doubles. The server rejects ranges past
//! `NumberOfAcquiredPoints`, so the worker only asks for what the last
//! status poll reported.

use super::{ClientError, ProdigyClient};
use crate::common::state::ControllerState;
use crate::common::OrdinateRange;
use crate::protocol::{self, Value};

/// One `GetAcquisitionStatus` poll result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquisitionStatus {
    /// Server-side controller state
    pub state: ControllerState,
    /// Energy samples completed so far in this iteration
    pub acquired_points: usize,
}

impl ProdigyClient {
    /// Poll `GetAcquisitionStatus`
    pub async fn acquisition_status(&mut self) -> Result<AcquisitionStatus, ClientError> {
        let outcome = self.exchange("GetAcquisitionStatus", &[]).await?;
        let token = outcome.require("ControllerState")?;
        let state = ControllerState::parse(token).ok_or_else(|| ClientError::BadValue {
            field: "ControllerState".to_string(),
            value: token.to_string(),
        })?;
        let acquired_points = outcome.parse_or("NumberOfAcquiredPoints", 0usize)?;
        Ok(AcquisitionStatus {
            state,
            acquired_points,
        })
    }

    /// Read acquired data for the sample range `[from, to]` (inclusive)
    ///
    /// Returns the doubles the server actually delivered; malformed array
    /// elements are dropped during parsing, so the count may be short. The
    /// caller decides what a short read means.
    pub async fn read_data_range(
        &mut self,
        from: usize,
        to: usize,
    ) -> Result<Vec<f64>, ClientError> {
        let outcome = self
            .exchange(
                "GetAcquisitionData",
                &[
                    ("FromIndex", Value::Integer(from as i64)),
                    ("ToIndex", Value::Integer(to as i64)),
                ],
            )
            .await?;
        let raw = outcome.require("Data")?;
        Ok(protocol::parse_double_array(raw)?)
    }

    /// Read the ordinate axis range via `GetSpectrumDataInfo`
    pub async fn ordinate_range(&mut self) -> Result<OrdinateRange, ClientError> {
        let outcome = self
            .exchange(
                "GetSpectrumDataInfo",
                &[("Name", Value::Token("OrdinateRange".to_string()))],
            )
            .await?;
        Ok(OrdinateRange {
            min: outcome.parse_or("Min", 0.0)?,
            max: outcome.parse_or("Max", 0.0)?,
            units: outcome.get("Units").unwrap_or_default().to_string(),
        })
    }
}

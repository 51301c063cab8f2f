/*!
SCPI client for the bench power supply that powers the DUT.

Each reading is a fixed exchange on the instrument link:

1. `INST:NSEL <n>` selects the output channel (1-based on the wire)
2. `MEAS:VOLT?` is queried and parsed; the value is not used, but the supply
   expects voltage and current queries in pairs after a channel select
3. `MEAS:CURR?` is queried and parsed, and returned

Nothing is retried. A failed exchange leaves the link suspect, so the next
exchange starts by clearing any stale input.
*/

use shared::error::InstrumentError;
use shared::protocol::{
    scpi_select_channel, SCPI_IDENTIFY, SCPI_MEASURE_CURRENT, SCPI_MEASURE_VOLTAGE, SCPI_TERMINATOR,
};
use tracing::{debug, warn};

use crate::channel::LineChannel;

/// One voltage/current pair taken from a supply channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstrumentReading {
    /// 0-based channel index
    pub channel: usize,
    pub volts: f64,
    pub amps: f64,
}

/// Request/response client owning the instrument link
pub struct InstrumentClient<C: LineChannel> {
    link: C,
    needs_resync: bool,
}

impl<C: LineChannel> InstrumentClient<C> {
    pub fn new(link: C) -> Self {
        Self {
            link,
            needs_resync: false,
        }
    }

    /// Query the identity string (`*IDN?`)
    pub fn identify(&mut self) -> Result<String, InstrumentError> {
        self.resync_if_needed()?;
        let result = self.query(SCPI_IDENTIFY);
        self.needs_resync = result.is_err();
        result
    }

    /// Read the supply current, in amperes, of a 0-based channel
    pub fn read_current(&mut self, channel: usize) -> Result<f64, InstrumentError> {
        self.read(channel).map(|reading| reading.amps)
    }

    /// Run the full select / voltage / current exchange on a 0-based channel
    pub fn read(&mut self, channel: usize) -> Result<InstrumentReading, InstrumentError> {
        self.resync_if_needed()?;
        let result = self.exchange(channel);
        if let Err(e) = &result {
            warn!("Instrument exchange on channel {} failed: {}", channel, e);
            self.needs_resync = true;
        }
        result
    }

    fn exchange(&mut self, channel: usize) -> Result<InstrumentReading, InstrumentError> {
        self.send(&scpi_select_channel(channel))?;
        let volts = self.query_number(SCPI_MEASURE_VOLTAGE)?;
        let amps = self.query_number(SCPI_MEASURE_CURRENT)?;
        debug!("Channel {}: {} V, {} A", channel, volts, amps);

        Ok(InstrumentReading {
            channel,
            volts,
            amps,
        })
    }

    fn resync_if_needed(&mut self) -> Result<(), InstrumentError> {
        if self.needs_resync {
            debug!("Clearing stale instrument input");
            self.link.clear_input()?;
            self.needs_resync = false;
        }
        Ok(())
    }

    fn send(&mut self, command: &str) -> Result<(), InstrumentError> {
        self.link
            .write_line(&format!("{}{}", command, SCPI_TERMINATOR))?;
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String, InstrumentError> {
        self.send(command)?;
        match self.link.read_line()? {
            Some(response) => Ok(response.trim().to_string()),
            None => Err(InstrumentError::timeout(command)),
        }
    }

    fn query_number(&mut self, command: &str) -> Result<f64, InstrumentError> {
        let response = self.query(command)?;
        response
            .parse::<f64>()
            .map_err(|_| InstrumentError::bad_response(command, response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::ScpiResponder;

    #[test]
    fn test_read_current_exchange() {
        let link = ScpiResponder::supply(5.02, 0.5);
        let log = link.log.clone();
        let mut client = InstrumentClient::new(link);

        assert_eq!(client.read_current(0).unwrap(), 0.5);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["INST:NSEL 1", "MEAS:VOLT?", "MEAS:CURR?"]
        );
    }

    #[test]
    fn test_channel_is_one_based_on_the_wire() {
        let link = ScpiResponder::supply(12.0, 1.25);
        let log = link.log.clone();
        let mut client = InstrumentClient::new(link);

        let reading = client.read(2).unwrap();
        assert_eq!(reading, InstrumentReading { channel: 2, volts: 12.0, amps: 1.25 });
        assert_eq!(log.lock().unwrap()[0], "INST:NSEL 3");
    }

    #[test]
    fn test_scientific_notation_response() {
        let link = ScpiResponder::new()
            .respond("MEAS:VOLT?", "+5.000000E+00")
            .respond("MEAS:CURR?", "1.234E-03\r");
        let mut client = InstrumentClient::new(link);
        assert_eq!(client.read_current(0).unwrap(), 1.234e-3);
    }

    #[test]
    fn test_bad_voltage_response_is_hard_error() {
        let link = ScpiResponder::new()
            .respond("MEAS:VOLT?", "-113,\"Undefined header\"")
            .respond("MEAS:CURR?", "0.5");
        let log = link.log.clone();
        let mut client = InstrumentClient::new(link);

        match client.read_current(0) {
            Err(InstrumentError::BadResponse { command, .. }) => assert_eq!(command, "MEAS:VOLT?"),
            other => panic!("expected BadResponse, got {:?}", other),
        }
        // No current query after the voltage failed
        assert!(!log.lock().unwrap().contains(&"MEAS:CURR?".to_string()));
    }

    #[test]
    fn test_silent_instrument_times_out() {
        let link = ScpiResponder::supply(5.0, 0.5).silence("MEAS:CURR?");
        let mut client = InstrumentClient::new(link);

        match client.read_current(0) {
            Err(InstrumentError::Timeout { command }) => assert_eq!(command, "MEAS:CURR?"),
            other => panic!("expected Timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_reply_is_cleared_after_failure() {
        // A late answer sits in the buffer; the first exchange reads it as the
        // voltage reply, fails, and the next exchange starts clean
        let link = ScpiResponder::supply(5.0, 0.5).stale("KEITHLEY late identity");
        let clears = link.clears.clone();
        let mut client = InstrumentClient::new(link);

        assert!(client.read_current(0).is_err());
        assert_eq!(client.read_current(0).unwrap(), 0.5);
        assert_eq!(*clears.lock().unwrap(), 1);
    }

    #[test]
    fn test_identify() {
        let mut client = InstrumentClient::new(ScpiResponder::supply(5.0, 0.5));
        assert!(client.identify().unwrap().starts_with("KEITHLEY"));

        let mut silent = InstrumentClient::new(ScpiResponder::new());
        assert!(matches!(silent.identify(), Err(InstrumentError::Timeout { .. })));
    }
}

//! Sample nets
//!
//! Small building-automation models used by the scenarios and benchmarks:
//! an outside-temperature generator, a heater/room loop exchanging tokens
//! over ports, a thermostat arbitrated by priorities, and a timed delay line.

use std::f64::consts::PI;
use std::time::Duration;

use pnsim_core::{Pattern, PetriNet, Place, SimResult, Token, TokenKind, Transition};

/// Hours in one generator cycle
pub const HOURS_PER_DAY: i64 = 24;

/// Hour of the daily temperature peak
const PEAK_HOUR: f64 = 14.0;

/// Daily temperature curve, warmest at `PEAK_HOUR`
pub fn daily_temperature(hour: i64, low: f64, high: f64) -> f64 {
    let mid = (low + high) / 2.0;
    let amplitude = (high - low) / 2.0;
    mid + amplitude * (2.0 * PI * (hour as f64 - PEAK_HOUR) / HOURS_PER_DAY as f64).cos()
}

/// Outside-temperature generator
///
/// `takt` ticks once per `period`, `tcalc` turns the hour into a raw
/// temperature and one of `trainy` (0.2), `tsunny` (0.2) or `texpec` (0.6)
/// settles the measurement published from `Measurement`.
pub fn weather_generator(name: &str, period: Duration, low: f64, high: f64) -> SimResult<PetriNet> {
    let mut net = PetriNet::new(name);
    net.add_place(
        Place::new("Generator")
            .checked(TokenKind::Int)
            .with_tokens([Token::from(0)])?,
    )?;
    net.add_place(Place::new("Hour").checked(TokenKind::Int))?;
    net.add_place(Place::new("Temperature_raw").checked(TokenKind::Float))?;
    net.add_place(Place::new("Measurement").checked(TokenKind::Float))?;

    net.add_transition(
        Transition::new("takt")
            .input("Generator", Pattern::var("k"))
            .output(
                "Generator",
                Pattern::expr("(k + 1) % 24", |b| {
                    Ok(Token::from((b.int("k")? + 1) % HOURS_PER_DAY))
                }),
            )
            .output("Hour", Pattern::var("k"))
            .with_timeout(period)?,
    )?;
    net.add_transition(
        Transition::new("tcalc")
            .input("Hour", Pattern::var("h"))
            .output(
                "Temperature_raw",
                Pattern::expr("daily(h)", move |b| {
                    Ok(Token::from(daily_temperature(b.int("h")?, low, high)))
                }),
            ),
    )?;
    net.add_transition(
        Transition::new("trainy")
            .input("Temperature_raw", Pattern::var("t"))
            .output(
                "Measurement",
                Pattern::expr("t - 1.0", |b| Ok(Token::from(b.float("t")? - 1.0))),
            )
            .with_probability(0.2)?
            .with_neighbour("tsunny")?
            .with_neighbour("texpec")?,
    )?;
    net.add_transition(
        Transition::new("tsunny")
            .input("Temperature_raw", Pattern::var("t"))
            .output(
                "Measurement",
                Pattern::expr("t + 1.0", |b| Ok(Token::from(b.float("t")? + 1.0))),
            )
            .with_probability(0.2)?,
    )?;
    net.add_transition(
        Transition::new("texpec")
            .input("Temperature_raw", Pattern::var("t"))
            .output("Measurement", Pattern::var("t"))
            .with_probability(0.6)?,
    )?;
    Ok(net)
}

/// Heater switched by boolean demands; each `true` emits `power` to `Q out`
pub fn heater(name: &str, power: f64) -> SimResult<PetriNet> {
    let mut net = PetriNet::new(name);
    net.add_place(Place::new("Switch").checked(TokenKind::Bool))?;
    net.add_place(Place::new("Q out").checked(TokenKind::Float))?;
    net.add_transition(
        Transition::new("heat")
            .input("Switch", Pattern::value(true))
            .output("Q out", Pattern::value(power)),
    )?;
    net.add_transition(Transition::new("idle").input("Switch", Pattern::value(false)))?;
    Ok(net)
}

/// Room warmed by the `heater` net until `target` is reached
///
/// The room asks for heat through `Demand` and receives it on `Q gain`; the
/// initial demand token starts the exchange.
pub fn room(name: &str, heater: &str, start: f64, target: f64) -> SimResult<PetriNet> {
    let mut net = PetriNet::new(name);
    net.add_place(Place::new("Q gain").checked(TokenKind::Float))?;
    net.add_place(
        Place::new("Temp")
            .checked(TokenKind::Float)
            .with_tokens([Token::from(start)])?,
    )?;
    net.add_place(
        Place::new("Demand")
            .checked(TokenKind::Bool)
            .with_tokens([Token::from(start < target)])?,
    )?;
    net.add_transition(
        Transition::new("warm")
            .input("Q gain", Pattern::var("q"))
            .input("Temp", Pattern::var("t"))
            .output(
                "Temp",
                Pattern::expr("t + q", |b| Ok(Token::from(b.float("t")? + b.float("q")?))),
            )
            .output(
                "Demand",
                Pattern::expr("t + q < target", move |b| {
                    Ok(Token::from(b.float("t")? + b.float("q")? < target))
                }),
            ),
    )?;
    net.add_remote_input("Q gain", &format!("{}/Q out", heater))?;
    net.add_remote_output("Demand", &format!("{}/Switch", heater))?;
    Ok(net)
}

/// Thermostat turning readings into heat commands
///
/// `hold` is declared first but carries the lowest priority, so readings
/// outside the dead band always reach `heat` or `cool`.
pub fn thermostat(name: &str, setpoint: f64, band: f64) -> SimResult<PetriNet> {
    let mut net = PetriNet::new(name);
    net.add_place(Place::new("Readings").checked(TokenKind::Float))?;
    net.add_place(
        Place::new("Setpoint")
            .checked(TokenKind::Float)
            .with_tokens([Token::from(setpoint)])?,
    )?;
    net.add_place(Place::new("Command").checked(TokenKind::Bool))?;

    net.add_transition(
        Transition::new("hold")
            .input("Readings", Pattern::var("t"))
            .input("Setpoint", Pattern::var("s"))
            .output("Setpoint", Pattern::var("s"))
            .with_priority(10)?,
    )?;
    net.add_transition(
        Transition::new("heat")
            .input("Readings", Pattern::var("t"))
            .input("Setpoint", Pattern::var("s"))
            .when("t < s - band", move |b| match (b.float("t"), b.float("s")) {
                (Ok(t), Ok(s)) => t < s - band,
                _ => false,
            })
            .output("Setpoint", Pattern::var("s"))
            .output("Command", Pattern::value(true))
            .with_priority(90)?,
    )?;
    net.add_transition(
        Transition::new("cool")
            .input("Readings", Pattern::var("t"))
            .input("Setpoint", Pattern::var("s"))
            .when("t > s + band", move |b| match (b.float("t"), b.float("s")) {
                (Ok(t), Ok(s)) => t > s + band,
                _ => false,
            })
            .output("Setpoint", Pattern::var("s"))
            .output("Command", Pattern::value(false))
            .with_priority(90)?,
    )?;
    Ok(net)
}

/// Moves each token of `Queue` to `Done`, one per `timeout`
pub fn delay_line(name: &str, timeout: Duration, tokens: &[i64]) -> SimResult<PetriNet> {
    let mut net = PetriNet::new(name);
    net.add_place(
        Place::new("Queue")
            .checked(TokenKind::Int)
            .with_tokens(tokens.iter().map(|t| Token::from(*t)))?,
    )?;
    net.add_place(Place::new("Done").checked(TokenKind::Int))?;
    net.add_transition(
        Transition::new("delay")
            .input("Queue", Pattern::var("x"))
            .output("Done", Pattern::var("x"))
            .with_timeout(timeout)?,
    )?;
    Ok(net)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn run(net: &mut PetriNet) -> pnsim_core::RunReport {
        let mut rng = StdRng::seed_from_u64(7);
        net.run(&mut rng, &|| false).unwrap()
    }

    #[test]
    fn test_daily_temperature_curve() {
        assert!((daily_temperature(14, 10.0, 20.0) - 20.0).abs() < 1e-9);
        assert!((daily_temperature(2, 10.0, 20.0) - 10.0).abs() < 1e-9);
        assert!((daily_temperature(8, 10.0, 20.0) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_weather_generator_prepares() {
        let mut net = weather_generator("weather", Duration::from_millis(10), 5.0, 15.0).unwrap();
        net.prepare().unwrap();
        let report = run(&mut net);
        // takt holds the first hour until unblocked
        assert_eq!(report.fired.len(), 1);
        assert_eq!(report.timers.len(), 1);
        assert_eq!(report.timers[0].transition, "takt");
    }

    #[test]
    fn test_weather_measurement_within_noise() {
        let mut net = weather_generator("weather", Duration::from_millis(10), 5.0, 15.0).unwrap();
        run(&mut net);
        let takt = net.transition_index("takt").unwrap();
        assert_eq!(net.unblock(takt).unwrap(), None);
        run(&mut net);
        let marking = net.marking();
        // hour 1 is already held by takt again
        assert!(marking["Generator"].is_empty());
        assert!(marking["Hour"].is_empty());
        assert_eq!(marking["Measurement"].len(), 1);
        let measured = marking["Measurement"][0].as_float().unwrap();
        let expected = daily_temperature(0, 5.0, 15.0);
        assert!((measured - expected).abs() <= 1.0 + 1e-9);
    }

    #[test]
    fn test_thermostat_priorities() {
        let mut net = thermostat("boiler", 20.0, 0.5).unwrap();
        net.deposit(
            "Readings",
            vec![Token::from(18.0), Token::from(20.2), Token::from(22.0)],
        )
        .unwrap();
        let report = run(&mut net);
        let fired: Vec<&str> = report.fired.iter().map(|s| s.transition.as_str()).collect();
        assert_eq!(fired, vec!["heat", "cool", "hold"]);
        let marking = net.marking();
        assert!(marking["Readings"].is_empty());
        assert_eq!(marking["Command"], vec![Token::from(false), Token::from(true)]);
        assert_eq!(marking["Setpoint"], vec![Token::from(20.0)]);
    }

    #[test]
    fn test_room_declares_ports() {
        let net = room("room", "heater", 18.0, 20.0).unwrap();
        let ports: Vec<String> = net.ports().iter().map(|p| p.topic.to_string()).collect();
        assert_eq!(ports, vec!["heater/Q out", "heater/Switch"]);
    }

    #[test]
    fn test_heater_answers_demands() {
        let mut net = heater("heater", 0.5).unwrap();
        net.deposit("Switch", vec![Token::from(true), Token::from(false)])
            .unwrap();
        run(&mut net);
        let marking = net.marking();
        assert!(marking["Switch"].is_empty());
        assert_eq!(marking["Q out"], vec![Token::from(0.5)]);
    }

    #[test]
    fn test_delay_line_queues_bindings() {
        let mut net = delay_line("line", Duration::from_millis(5), &[1, 2, 3]).unwrap();
        let report = run(&mut net);
        assert_eq!(report.fired.len(), 3);
        assert_eq!(report.timers.len(), 1);
        let delay = net.transition_index("delay").unwrap();
        assert_eq!(net.unblock(delay).unwrap(), Some(Duration::from_millis(5)));
        assert_eq!(net.marking()["Done"], vec![Token::from(1)]);
    }
}

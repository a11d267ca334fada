//! Default logging setup for the UDO runtime binaries
#![warn(missing_docs)]

use std::time::Instant;

const TIMESTAMP_STYLE: anstyle::Style =
    anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::BrightBlack)));

const TARGET_STYLE: anstyle::Style =
    anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Magenta)));

/// Perform the default logging setup used by the sample binaries.
///
/// The filter is read from `UDO_LOG` (default `info`), the color choice from
/// `UDO_LOG_STYLE`. Each line carries the time elapsed since setup, the
/// level, the log target, and the message.
pub fn setup() {
    let start_time = Instant::now();

    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("UDO_LOG", "info")
            .write_style("UDO_LOG_STYLE"),
    )
    .format(move |buf, record| {
        use std::io::Write;

        let timestamp = start_time.elapsed();
        let level = record.level();
        let target = record.target();

        writeln!(
            buf,
            "{} {} {} {}",
            format_args!("{style}{timestamp:>9.2?}{style:#}", style = TIMESTAMP_STYLE),
            format_args!(
                "{style}{level}{style:#}",
                style = buf.default_level_style(level),
            ),
            format_args!("{style}{target}{style:#}", style = TARGET_STYLE),
            record.args(),
        )
    })
    .init();
}

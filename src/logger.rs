// Copyright 2024-2026 chronicle-store contributors.
// This file is part of chronicle-store.

// chronicle-store is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// chronicle-store is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with chronicle-store.  If not, see <http://www.gnu.org/licenses/>.

//! logging

use std::io;
use std::path::Path;

use fern::colors::{Color, ColoredLevelConfig};

/// Initialize logging: colored stdout at `std`, plus an optional
/// timestamped file dispatch at `file` level.
pub fn init_logger(std: log::LevelFilter, file: Option<(&Path, log::LevelFilter)>) -> io::Result<()> {
	let colors = ColoredLevelConfig::new()
		.info(Color::Green)
		.warn(Color::Yellow)
		.error(Color::Red)
		.debug(Color::Blue)
		.trace(Color::Magenta);

	let stdout_dispatcher = fern::Dispatch::new()
		.level(std)
		.level_for("chronicle_store", std)
		.level_for("sqlx", log::LevelFilter::Error)
		.format(move |out, message, record| {
			out.finish(format_args!(
				"{} {} {}",
				chrono::Local::now().format("[%H:%M]"),
				colors.color(record.level()),
				message,
			))
		})
		.chain(std::io::stdout());

	let mut root = fern::Dispatch::new().chain(stdout_dispatcher);

	if let Some((path, level)) = file {
		let file_dispatcher = fern::Dispatch::new()
			.level(level)
			.level_for("chronicle_store", level)
			.level_for("sqlx", log::LevelFilter::Warn)
			.format(move |out, message, record| {
				out.finish(format_args!(
					"{} [{}][{}] {}",
					chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
					record.target(),
					record.level(),
					message,
				))
			})
			.chain(fern::log_file(path)?);
		root = root.chain(file_dispatcher);
	}

	root.apply().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
	Ok(())
}

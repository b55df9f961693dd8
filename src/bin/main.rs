// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use chrono::{TimeZone, Utc};
use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use parking_ledger_rs::{
    EndedBy, Engine, LocationId, ManualClock, PackageId, PaymentMethod, Policy, StaticCatalog,
    StaticGateway, TransactionStatus, UserId,
};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::debug;

/// Parking Ledger - Replay operation CSV files
///
/// Reads ledger operations from a CSV file, replays them against the engine
/// under a simulated clock, and outputs final user views to stdout.
#[derive(Parser, Debug)]
#[command(name = "parking-ledger-rs")]
#[command(about = "A parking ledger engine that replays operation CSVs", long_about = None)]
struct Args {
    /// Path to CSV file with operations
    ///
    /// Expected format: op,user,location,spot,package,method,reference,minutes
    /// Example: cargo run -- operations.csv > views.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Optional JSON policy file (thresholds, rates)
    #[arg(long, value_name = "FILE")]
    policy: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let policy = match &args.policy {
        Some(path) => match load_policy(path) {
            Ok(policy) => policy,
            Err(e) => {
                eprintln!("Error loading policy '{}': {}", path.display(), e);
                process::exit(1);
            }
        },
        None => Policy::default(),
    };

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    let engine = match replay_operations(BufReader::new(file), policy) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Error replaying operations: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = write_views(&engine, std::io::stdout()) {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }
}

fn load_policy(path: &PathBuf) -> Result<Policy, Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Raw CSV record matching the input format.
///
/// Fields: `op, user, location, spot, package, method, reference, minutes`
#[derive(Debug, Deserialize)]
struct CsvRecord {
    op: String,
    user: Option<String>,
    location: Option<String>,
    spot: Option<String>,
    package: Option<String>,
    method: Option<String>,
    reference: Option<String>,
    #[serde(deserialize_with = "csv::invalid_option")]
    minutes: Option<i64>,
}

/// A parsed replay operation.
#[derive(Debug)]
enum Operation {
    /// Advance the simulated clock.
    Advance { minutes: i64 },
    Purchase {
        user: UserId,
        package: PackageId,
        method: PaymentMethod,
        reference: Option<String>,
    },
    /// Complete the user's oldest pending transaction.
    Complete { user: UserId },
    /// Cancel the user's oldest pending transaction.
    CancelPurchase { user: UserId, reason: String },
    Bonus {
        user: UserId,
        minutes: i64,
        reference: String,
    },
    Start {
        user: UserId,
        location: LocationId,
        spot: Option<String>,
    },
    /// Advance the clock by `minutes`, then close the user's active session.
    End { user: UserId, minutes: i64 },
    CancelSession { user: UserId },
}

impl CsvRecord {
    /// Converts a CSV record into an operation.
    ///
    /// Returns `None` for unknown ops or missing required fields.
    fn into_operation(self) -> Option<Operation> {
        let CsvRecord {
            op,
            user,
            location,
            spot,
            package,
            method,
            reference,
            minutes,
        } = self;
        let user = user.map(UserId::new);

        match op.to_lowercase().as_str() {
            "advance" => Some(Operation::Advance { minutes: minutes? }),
            "purchase" => Some(Operation::Purchase {
                user: user?,
                package: PackageId::new(package?),
                method: parse_method(&method?)?,
                reference,
            }),
            "complete" => Some(Operation::Complete { user: user? }),
            "cancel_purchase" => Some(Operation::CancelPurchase {
                user: user?,
                reason: reference.unwrap_or_else(|| "cancelled in replay".to_string()),
            }),
            "bonus" => Some(Operation::Bonus {
                user: user?,
                minutes: minutes?,
                reference: reference.unwrap_or_else(|| "replay bonus".to_string()),
            }),
            "start" => Some(Operation::Start {
                user: user?,
                location: LocationId::new(location?),
                spot,
            }),
            "end" => Some(Operation::End {
                user: user?,
                minutes: minutes?,
            }),
            "cancel_session" => Some(Operation::CancelSession { user: user? }),
            _ => None,
        }
    }
}

fn parse_method(method: &str) -> Option<PaymentMethod> {
    match method.to_lowercase().as_str() {
        "transfer" => Some(PaymentMethod::Transfer),
        "cash" => Some(PaymentMethod::Cash),
        "card" => Some(PaymentMethod::Card),
        _ => None,
    }
}

/// Replays operations from a CSV reader against a fresh engine.
///
/// Streaming: arbitrarily large files are handled without loading them into
/// memory. Malformed rows and failed operations are skipped; replay is a
/// reporting tool, not a validator.
///
/// # Errors
///
/// Returns a CSV error if the reader fails or the CSV structure is invalid.
pub fn replay_operations<R: Read>(reader: R, policy: Policy) -> Result<Engine, csv::Error> {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
    ));
    let engine = Engine::new(
        Arc::new(StaticCatalog::standard()),
        Arc::new(StaticGateway::new()),
    )
    .with_policy(policy)
    .with_clock(clock.clone());

    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for result in rdr.deserialize::<CsvRecord>() {
        match result {
            Ok(record) => {
                let Some(op) = record.into_operation() else {
                    debug!("skipping invalid operation record");
                    continue;
                };
                apply_operation(&engine, &clock, op);
            }
            Err(e) => {
                debug!("skipping malformed row: {}", e);
                continue;
            }
        }
    }

    Ok(engine)
}

fn apply_operation(engine: &Engine, clock: &ManualClock, op: Operation) {
    let outcome = match op {
        Operation::Advance { minutes } => {
            clock.advance_minutes(minutes);
            Ok(())
        }
        Operation::Purchase {
            user,
            package,
            method,
            reference,
        } => engine
            .initiate_purchase(user, &package, method, reference)
            .map(|_| ()),
        Operation::Complete { user } => match oldest_pending(engine, &user) {
            Some(id) => engine.complete_transaction(&id).map(|_| ()),
            None => Ok(()),
        },
        Operation::CancelPurchase { user, reason } => match oldest_pending(engine, &user) {
            Some(id) => engine.cancel_transaction(&id, reason).map(|_| ()),
            None => Ok(()),
        },
        Operation::Bonus {
            user,
            minutes,
            reference,
        } => engine.grant_bonus(user, minutes, reference).map(|_| ()),
        Operation::Start {
            user,
            location,
            spot,
        } => engine.start_session(user, location, spot).map(|_| ()),
        Operation::End { user, minutes } => {
            clock.advance_minutes(minutes);
            match engine.get_active_session(&user) {
                Some(session) => engine
                    .end_session(&session.session_id, EndedBy::System)
                    .map(|_| ()),
                None => Ok(()),
            }
        }
        Operation::CancelSession { user } => match engine.get_active_session(&user) {
            Some(session) => engine.cancel_session(&session.session_id).map(|_| ()),
            None => Ok(()),
        },
    };

    if let Err(e) = outcome {
        debug!("skipping failed operation: {}", e);
    }
}

fn oldest_pending(engine: &Engine, user: &UserId) -> Option<parking_ledger_rs::TransactionId> {
    engine
        .transactions_of(user)
        .into_iter()
        .find(|t| t.status == TransactionStatus::Pending)
        .map(|t| t.transaction_id)
}

/// Output row: one user view per line.
#[derive(Debug, Serialize)]
struct ViewRecord {
    user: String,
    minutes: i64,
    version: u64,
    active_session: bool,
    low_balance: bool,
    critical_balance: bool,
}

/// Writes final user views to a CSV writer.
///
/// # CSV Format
///
/// Columns: `user, minutes, version, active_session, low_balance,
/// critical_balance`
///
/// # Errors
///
/// Returns a CSV error if writing fails.
pub fn write_views<W: Write>(engine: &Engine, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);

    let mut rows = engine.user_minutes();
    rows.sort_by(|a, b| a.user_id.0.cmp(&b.user_id.0));

    for row in rows {
        let view = engine.user_view(&row.user_id);
        wtr.serialize(ViewRecord {
            user: view.user_id.0,
            minutes: view.minutes,
            version: view.version,
            active_session: view.active_session.is_some(),
            low_balance: view.low_balance,
            critical_balance: view.critical_balance,
        })?;
    }

    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn replay(csv: &str) -> Engine {
        replay_operations(Cursor::new(csv), Policy::default()).unwrap()
    }

    #[test]
    fn parse_card_purchase() {
        let csv = "op,user,location,spot,package,method,reference,minutes\n\
                   purchase,u1,,,pkg-60,card,tok-visa,\n";
        let engine = replay(csv);
        assert_eq!(engine.user_view(&UserId::new("u1")).minutes, 60);
    }

    #[test]
    fn transfer_purchase_stays_pending_until_complete() {
        let csv = "op,user,location,spot,package,method,reference,minutes\n\
                   purchase,u1,,,pkg-60,transfer,slip-1,\n";
        let engine = replay(csv);
        assert_eq!(engine.user_view(&UserId::new("u1")).minutes, 0);

        let csv = "op,user,location,spot,package,method,reference,minutes\n\
                   purchase,u1,,,pkg-60,transfer,slip-1,\n\
                   complete,u1,,,,,,\n";
        let engine = replay(csv);
        assert_eq!(engine.user_view(&UserId::new("u1")).minutes, 60);
    }

    #[test]
    fn parse_session_lifecycle() {
        let csv = "op,user,location,spot,package,method,reference,minutes\n\
                   purchase,u1,,,pkg-60,card,tok-visa,\n\
                   start,u1,downtown,B-12,,,,\n\
                   end,u1,,,,,,12\n";
        let engine = replay(csv);

        let view = engine.user_view(&UserId::new("u1"));
        assert_eq!(view.minutes, 48);
        assert!(view.active_session.is_none());
    }

    #[test]
    fn start_without_balance_is_skipped() {
        let csv = "op,user,location,spot,package,method,reference,minutes\n\
                   start,u1,downtown,,,,,\n";
        let engine = replay(csv);
        assert!(engine.get_active_session(&UserId::new("u1")).is_none());
    }

    #[test]
    fn skip_malformed_rows() {
        let csv = "op,user,location,spot,package,method,reference,minutes\n\
                   purchase,u1,,,pkg-60,card,tok-visa,\n\
                   not-an-op,x,y,z,,,,\n\
                   bonus,u2,,,,,welcome,30\n";
        let engine = replay(csv);

        assert_eq!(engine.user_view(&UserId::new("u1")).minutes, 60);
        assert_eq!(engine.user_view(&UserId::new("u2")).minutes, 30);
    }

    #[test]
    fn parse_with_whitespace() {
        let csv = "op,user,location,spot,package,method,reference,minutes\n \
                   bonus , u1 , , , , , welcome , 30 \n";
        let engine = replay(csv);
        assert_eq!(engine.user_view(&UserId::new("u1")).minutes, 30);
    }

    #[test]
    fn write_views_to_csv() {
        let csv = "op,user,location,spot,package,method,reference,minutes\n\
                   bonus,u1,,,,,welcome,30\n\
                   bonus,u2,,,,,welcome,5\n";
        let engine = replay(csv);

        let mut output = Vec::new();
        write_views(&engine, &mut output).unwrap();
        let output = String::from_utf8(output).unwrap();

        assert!(output
            .contains("user,minutes,version,active_session,low_balance,critical_balance"));
        assert!(output.contains("u1,30,1,false,false,false"));
        assert!(output.contains("u2,5,1,false,true,true"));
    }
}

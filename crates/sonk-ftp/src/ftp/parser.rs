//! LIST output parsing (Unix `ls -l` style and DOS style).

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};

use crate::ftp::types::{FtpEntry, FtpEntryKind};

/// Parse a LIST response body into entries. Lines that match neither known
/// format are skipped.
pub fn parse_listing(data: &str) -> Vec<FtpEntry> {
    data.lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .filter_map(parse_line)
        .collect()
}

fn parse_line(line: &str) -> Option<FtpEntry> {
    parse_unix_line(line).or_else(|| parse_dos_line(line))
}

// ── Unix format ──────────────────────────────────────────────────────
// -rw-r--r--   1 owner    group        1234 Jan 15 12:30 file.txt
// lrwxrwxrwx   1 owner    group           9 Jan 15  2023 link -> target

fn parse_unix_line(line: &str) -> Option<FtpEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 9 {
        return None;
    }
    let perms = parts[0];
    if perms.len() != 10 {
        return None;
    }
    let kind = match perms.chars().next()? {
        '-' => FtpEntryKind::File,
        'd' => FtpEntryKind::Directory,
        'l' => FtpEntryKind::Symlink,
        _ => return None,
    };

    let size = parts[4].parse::<u64>().ok()?;
    let modified = parse_unix_date(parts[5], parts[6], parts[7]);

    let mut name = parts[8..].join(" ");
    let mut link_target = None;
    if kind == FtpEntryKind::Symlink {
        if let Some((n, target)) = name.split_once(" -> ") {
            link_target = Some(target.to_string());
            name = n.to_string();
        }
    }

    Some(FtpEntry {
        name,
        kind,
        size,
        modified,
        permissions: Some(perms.to_string()),
        owner: Some(parts[2].to_string()),
        group: Some(parts[3].to_string()),
        link_target,
        raw: line.to_string(),
    })
}

/// `Jan 15 12:30` (current year) or `Jan 15 2023`.
fn parse_unix_date(month: &str, day: &str, year_or_time: &str) -> Option<DateTime<Utc>> {
    let month = match month {
        "Jan" => 1,
        "Feb" => 2,
        "Mar" => 3,
        "Apr" => 4,
        "May" => 5,
        "Jun" => 6,
        "Jul" => 7,
        "Aug" => 8,
        "Sep" => 9,
        "Oct" => 10,
        "Nov" => 11,
        "Dec" => 12,
        _ => return None,
    };
    let day = day.parse::<u32>().ok()?;

    let (year, hour, minute) = if let Some((h, m)) = year_or_time.split_once(':') {
        (
            Utc::now().year(),
            h.parse::<u32>().ok()?,
            m.parse::<u32>().ok()?,
        )
    } else {
        (year_or_time.parse::<i32>().ok()?, 0, 0)
    };

    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    let time = date.and_hms_opt(hour, minute, 0)?;
    Some(Utc.from_utc_datetime(&time))
}

// ── DOS format ───────────────────────────────────────────────────────
// 01-15-24  12:30PM       <DIR>          subdir
// 01-15-24  12:30PM              1234    file.txt

fn parse_dos_line(line: &str) -> Option<FtpEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 {
        return None;
    }
    let modified = parse_dos_date(parts[0], parts[1]);
    modified?;

    let (kind, size) = if parts[2].eq_ignore_ascii_case("<dir>") {
        (FtpEntryKind::Directory, 0)
    } else {
        (FtpEntryKind::File, parts[2].parse::<u64>().ok()?)
    };

    Some(FtpEntry {
        name: parts[3..].join(" "),
        kind,
        size,
        modified,
        permissions: None,
        owner: None,
        group: None,
        link_target: None,
        raw: line.to_string(),
    })
}

/// `MM-DD-YY` plus `HH:MM(AM|PM)`.
fn parse_dos_date(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let mut date_parts = date.split('-');
    let month = date_parts.next()?.parse::<u32>().ok()?;
    let day = date_parts.next()?.parse::<u32>().ok()?;
    let year_raw = date_parts.next()?.parse::<i32>().ok()?;
    let year = if year_raw < 100 { 2000 + year_raw } else { year_raw };

    let upper = time.to_ascii_uppercase();
    let (clock, pm) = if let Some(rest) = upper.strip_suffix("PM") {
        (rest.to_string(), true)
    } else if let Some(rest) = upper.strip_suffix("AM") {
        (rest.to_string(), false)
    } else {
        (upper, false)
    };
    let (h, m) = clock.split_once(':')?;
    let mut hour = h.parse::<u32>().ok()?;
    let minute = m.parse::<u32>().ok()?;
    if pm && hour < 12 {
        hour += 12;
    }
    if !pm && hour == 12 {
        hour = 0;
    }

    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    let time = date.and_hms_opt(hour, minute, 0)?;
    Some(Utc.from_utc_datetime(&time))
}

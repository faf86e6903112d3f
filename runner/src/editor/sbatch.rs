//! `#SBATCH` directives of a submit script

const PREFIX: &str = "#SBATCH";

/// Submit script kept line by line so edits leave everything else untouched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitScript {
    lines: Vec<String>,
}

/// Split `#SBATCH --name=value`, `#SBATCH --name value`, `#SBATCH -n value`
/// and `#SBATCH -nvalue` into option and value
fn directive(line: &str) -> Option<(&str, &str)> {
    let rest = line.trim_start().strip_prefix(PREFIX)?.trim();

    if let Some(long) = rest.strip_prefix("--") {
        let (name, value) = long
            .split_once('=')
            .or_else(|| long.split_once(char::is_whitespace))
            .unwrap_or((long, ""));

        return Some((&rest[..name.len() + 2], value.trim()));
    }

    if rest.starts_with('-') && rest.len() >= 2 && rest.is_char_boundary(2) {
        let (name, value) = rest.split_at(2);

        return Some((name, value.trim()));
    }

    None
}

fn render_directive(name: &str, value: &str) -> String {
    if name.starts_with("--") {
        format!("{PREFIX} {name}={value}")
    } else {
        format!("{PREFIX} {name} {value}")
    }
}

impl SubmitScript {
    pub fn parse(content: &str) -> Self {
        Self {
            lines: content.lines().map(str::to_owned).collect(),
        }
    }

    pub fn render(&self) -> String {
        let mut output = self.lines.join("\n");
        output.push('\n');
        output
    }

    /// value of the first directive spelled as any of `names`
    pub fn get(&self, names: &[&str]) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            let (name, value) = directive(line)?;

            names.contains(&name).then_some(value)
        })
    }

    /// Replace every directive spelled as any of `names`, keeping its
    /// spelling, or add `names[0]` after the last directive if there is none
    pub fn set(&mut self, names: &[&str], value: &str) {
        let mut found = false;

        for existing in self.lines.iter_mut() {
            let Some((name, _)) = directive(existing).filter(|(name, _)| names.contains(name)) else {
                continue;
            };

            let line = render_directive(name, value);
            *existing = line;
            found = true;
        }

        if found {
            return;
        }

        let after_shebang = self.lines.first().map(|first| first.starts_with("#!")).unwrap_or(false);
        let position = self
            .lines
            .iter()
            .rposition(|existing| directive(existing).is_some())
            .map(|index| index + 1)
            .unwrap_or(usize::from(after_shebang));

        self.lines.insert(position, render_directive(names[0], value));
    }

    pub fn ntasks(&self) -> Option<u32> {
        self.get(&["-n", "--ntasks"])?.parse().ok()
    }

    pub fn set_ntasks(&mut self, ntasks: u32) {
        self.set(&["-n", "--ntasks"], &ntasks.to_string());
    }

    pub fn cpus_per_task(&self) -> Option<u32> {
        self.get(&["-c", "--cpus-per-task"])?.parse().ok()
    }

    pub fn set_cpus_per_task(&mut self, cpus: u32) {
        self.set(&["-c", "--cpus-per-task"], &cpus.to_string());
    }

    /// wall clock limit in seconds
    pub fn walltime(&self) -> Option<u64> {
        parse_walltime(self.get(&["-t", "--time"])?)
    }

    pub fn set_walltime(&mut self, seconds: u64) {
        self.set(&["-t", "--time"], &format_walltime(seconds));
    }

    /// `--mem-per-cpu` in MB
    pub fn memory_per_cpu(&self) -> Option<u64> {
        parse_memory(self.get(&["--mem-per-cpu"])?)
    }

    pub fn set_memory_per_cpu(&mut self, megabytes: u64) {
        self.set(&["--mem-per-cpu"], &format_memory(megabytes));
    }

    /// `--mem` (per node) in MB
    pub fn memory(&self) -> Option<u64> {
        parse_memory(self.get(&["--mem"])?)
    }

    pub fn set_memory(&mut self, megabytes: u64) {
        self.set(&["--mem"], &format_memory(megabytes));
    }
}

/// Slurm time formats: `M`, `M:S`, `H:M:S`, `D-H`, `D-H:M` and `D-H:M:S`
pub fn parse_walltime(value: &str) -> Option<u64> {
    let value = value.trim();
    let (days, clock) = match value.split_once('-') {
        Some((days, clock)) => (Some(days.parse::<u64>().ok()?), clock),
        None => (None, value),
    };

    let parts = clock
        .split(':')
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<Vec<u64>>>()?;

    let (hours, minutes, seconds) = match (days.is_some(), parts.as_slice()) {
        (false, [minutes]) => (0, *minutes, 0),
        (false, [minutes, seconds]) => (0, *minutes, *seconds),
        (_, [hours, minutes, seconds]) => (*hours, *minutes, *seconds),
        (true, [hours]) => (*hours, 0, 0),
        (true, [hours, minutes]) => (*hours, *minutes, 0),
        _ => return None,
    };

    Some(days.unwrap_or(0) * 86_400 + hours * 3600 + minutes * 60 + seconds)
}

/// `D-HH:MM:SS`
pub fn format_walltime(seconds: u64) -> String {
    format!(
        "{}-{:02}:{:02}:{:02}",
        seconds / 86_400,
        seconds % 86_400 / 3600,
        seconds % 3600 / 60,
        seconds % 60
    )
}

/// Slurm memory sizes, megabytes unless suffixed with `K`, `M`, `G` or `T`
pub fn parse_memory(value: &str) -> Option<u64> {
    let value = value.trim().to_uppercase();
    let split = value.find(|c: char| !c.is_ascii_digit()).unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: u64 = number.parse().ok()?;

    match unit.trim_end_matches('B') {
        "" | "M" => Some(number),
        "K" => Some(number / 1024),
        "G" => Some(number * 1024),
        "T" => Some(number * 1024 * 1024),
        _ => None,
    }
}

pub fn format_memory(megabytes: u64) -> String {
    if megabytes > 0 && megabytes % 1024 == 0 {
        format!("{}G", megabytes / 1024)
    } else {
        format!("{megabytes}M")
    }
}

#[cfg(test)]
#[path = "sbatch_test.rs"]
mod sbatch_test;

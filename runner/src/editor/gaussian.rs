//! Minimal model of a Gaussian input (`.gjf`): link 0 commands, route,
//! molecule specification and whatever follows it.

use itertools::Itertools;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GaussianInput {
    /// `%nprocshared=4`, `%mem=8gb`, `%chk=...`
    pub link0: Vec<String>,
    /// `#`, `#p`, `#n` or `#t`
    pub route_prefix: String,
    pub keywords: Vec<String>,
    pub title: Vec<String>,
    /// `<charge> <multiplicity>`, absent when the geometry is read from the checkpoint
    pub charge_multiplicity: Option<String>,
    pub coordinates: Vec<String>,
    /// trailing sections (modredundant input, basis sets, ...), one entry per section
    pub trailer: Vec<Vec<String>>,
}

fn sections(content: &str) -> Vec<Vec<&str>> {
    let groups = content
        .lines()
        .map(str::trim_end)
        .group_by(|line| line.trim().is_empty());

    let sections = groups
        .into_iter()
        .filter(|(blank, _)| !blank)
        .map(|(_, lines)| lines.collect())
        .collect();

    sections
}

impl GaussianInput {
    pub fn parse(content: &str) -> Option<Self> {
        let mut sections = sections(content).into_iter();
        let header = sections.next()?;

        let mut link0 = Vec::new();
        let mut route = Vec::new();
        for line in header {
            if route.is_empty() && line.trim_start().starts_with('%') {
                link0.push(line.trim().to_owned());
            } else {
                route.push(line.trim());
            }
        }

        let route = route.join(" ");
        let route = route.trim_start().strip_prefix('#')?;
        let (route_prefix, route) = match route.chars().next() {
            Some(level @ ('p' | 'P' | 'n' | 'N' | 't' | 'T'))
                if route[1..].starts_with(char::is_whitespace) =>
            {
                (format!("#{level}"), &route[1..])
            }
            _ => ("#".to_owned(), route),
        };
        let keywords: Vec<String> = route.split_whitespace().map(str::to_owned).collect();

        let mut input = Self {
            link0,
            route_prefix,
            keywords,
            title: Vec::new(),
            charge_multiplicity: None,
            coordinates: Vec::new(),
            trailer: Vec::new(),
        };

        if !input.reads_geometry_from_checkpoint() {
            input.title = sections
                .next()
                .map(|title| title.iter().map(|line| line.to_string()).collect())
                .unwrap_or_default();

            if let Some(molecule) = sections.next() {
                let mut lines = molecule.into_iter();
                input.charge_multiplicity = lines.next().map(|line| line.trim().to_owned());
                input.coordinates = lines.map(|line| line.to_string()).collect();
            }
        }

        input.trailer = sections
            .map(|section| section.iter().map(|line| line.to_string()).collect())
            .collect();

        Some(input)
    }

    /// `geom=allcheck`/`geom=check` omit title and molecule specification
    pub fn reads_geometry_from_checkpoint(&self) -> bool {
        self.keywords.iter().any(|keyword| {
            let keyword = keyword.to_lowercase();

            keyword.starts_with("geom=") && keyword.contains("check")
        })
    }

    pub fn render(&self) -> String {
        let mut output = String::new();

        for line in self.link0.iter() {
            output.push_str(line);
            output.push('\n');
        }

        output.push_str(&self.route_prefix);
        output.push(' ');
        output.push_str(&self.keywords.join(" "));
        output.push_str("\n\n");

        if !self.reads_geometry_from_checkpoint() {
            let title = if self.title.is_empty() {
                "title".to_owned()
            } else {
                self.title.join("\n")
            };
            output.push_str(&title);
            output.push_str("\n\n");

            if let Some(ref charge_multiplicity) = self.charge_multiplicity {
                output.push_str(charge_multiplicity);
                output.push('\n');
            }
            for line in self.coordinates.iter() {
                output.push_str(line);
                output.push('\n');
            }
            output.push('\n');
        }

        for section in self.trailer.iter() {
            output.push_str(&section.join("\n"));
            output.push_str("\n\n");
        }

        // Gaussian wants a trailing blank line
        output.push('\n');

        output
    }

    fn link0_value(&self, name: &str) -> Option<&str> {
        self.link0.iter().find_map(|line| {
            let (key, value) = line.trim_start_matches('%').split_once('=')?;

            key.trim().eq_ignore_ascii_case(name).then_some(value.trim())
        })
    }

    fn set_link0(&mut self, name: &str, value: String) {
        let line = format!("%{name}={value}");

        match self.link0.iter_mut().find(|line| {
            line.trim_start_matches('%')
                .split_once('=')
                .map(|(key, _)| key.trim().eq_ignore_ascii_case(name))
                .unwrap_or(false)
        }) {
            Some(existing) => *existing = line,
            None => self.link0.push(line),
        }
    }

    pub fn nprocs(&self) -> Option<u32> {
        self.link0_value("nprocshared")
            .or_else(|| self.link0_value("nprocs"))
            .and_then(|value| value.parse().ok())
    }

    pub fn set_nprocs(&mut self, nprocs: u32) {
        // %nprocs is the older spelling of the same directive
        self.link0.retain(|line| {
            !line
                .trim_start_matches('%')
                .to_lowercase()
                .starts_with("nprocs=")
        });
        self.set_link0("nprocshared", nprocs.to_string());
    }

    /// `%mem` in GB, other units are converted
    pub fn memory_gb(&self) -> Option<f64> {
        let value = self.link0_value("mem")?.to_lowercase();
        let split = value.find(|c: char| !c.is_ascii_digit() && c != '.').unwrap_or(value.len());
        let (number, unit) = value.split_at(split);
        let number: f64 = number.parse().ok()?;

        match unit.trim() {
            "gb" | "g" => Some(number),
            "mb" | "m" => Some(number / 1024.0),
            "tb" | "t" => Some(number * 1024.0),
            // word based units are left alone
            _ => None,
        }
    }

    pub fn set_memory_gb(&mut self, memory: u32) {
        self.set_link0("mem", format!("{memory}gb"));
    }

    /// Remove keywords starting with any of `conflicts` (case insensitive) and
    /// append `additions`. Returns the removed keywords.
    pub fn merge_keywords(&mut self, additions: &[&str], conflicts: &[&str]) -> Vec<String> {
        let (filtered, kept): (Vec<String>, Vec<String>) = self.keywords.drain(..).partition(|keyword| {
            let keyword = keyword.to_lowercase();

            conflicts
                .iter()
                .any(|conflict| keyword.starts_with(&conflict.to_lowercase()))
        });

        self.keywords = kept;
        self.keywords
            .extend(additions.iter().map(|keyword| keyword.to_string()));

        filtered
    }

    /// `opt` -> `opt=readfc`, `opt=tight` -> `opt=(readfc,tight)`
    pub fn read_force_constants(&mut self) {
        for keyword in self.keywords.iter_mut() {
            let lower = keyword.to_lowercase();

            if lower == "opt" {
                *keyword = "opt=readfc".to_owned();
            } else if let Some(options) = lower.strip_prefix("opt=") {
                let options = options.trim_start_matches('(').trim_end_matches(')');

                if !options.split(',').any(|option| option.trim() == "readfc") {
                    *keyword = format!("opt=(readfc,{options})");
                }
            }
        }
    }

    /// drop the molecule specification so the geometry comes from the checkpoint
    pub fn clear_molecule(&mut self) {
        self.title.clear();
        self.charge_multiplicity = None;
        self.coordinates.clear();
    }
}

#[cfg(test)]
#[path = "gaussian_test.rs"]
mod gaussian_test;

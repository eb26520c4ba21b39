//! The persona registry.

use crate::error::{Error, Result};
use crate::types::{Persona, PersonaId};

/// Ordered list of personas. The default persona is always present and always first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonaRegistry {
    personas: Vec<Persona>,
}

impl PersonaRegistry {
    /// Creates a registry holding only the default persona.
    pub fn new() -> Self {
        Self {
            personas: vec![Persona::default()],
        }
    }

    /// Restores a registry from a stored list, re-inserting the default persona if missing.
    pub fn from_list(personas: Vec<Persona>) -> Self {
        let mut registry = Self {
            personas: Vec::with_capacity(personas.len() + 1),
        };
        registry.personas.push(
            personas
                .iter()
                .find(|p| p.is_default())
                .cloned()
                .unwrap_or_default(),
        );
        for persona in personas {
            if !persona.is_default() && registry.get(&persona.id).is_none() {
                registry.personas.push(persona);
            }
        }
        registry
    }

    /// Parses a YAML list of personas, as used for `--personas` seed files.
    pub fn parse_seed(yaml: &str) -> Result<Vec<Persona>> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Reads a YAML seed file.
    pub fn load_seed(path: &str) -> Result<Vec<Persona>> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|err| Error::io(format!("failed to read persona file {path}"), err))?;
        Self::parse_seed(&yaml)
    }

    /// Adds every seed whose name is not already taken. Returns how many were added.
    pub fn merge_seed(&mut self, seeds: Vec<Persona>) -> usize {
        let mut added = 0;
        for seed in seeds {
            let taken = self
                .personas
                .iter()
                .any(|p| p.name.eq_ignore_ascii_case(&seed.name));
            if !taken && self.add(seed).is_ok() {
                added += 1;
            }
        }
        added
    }

    /// All personas, default first.
    pub fn list(&self) -> &[Persona] {
        &self.personas
    }

    /// Looks up a persona by id.
    pub fn get(&self, id: &PersonaId) -> Option<&Persona> {
        self.personas.iter().find(|p| &p.id == id)
    }

    /// The built-in default persona.
    pub fn default_persona(&self) -> &Persona {
        &self.personas[0]
    }

    /// Adds a persona.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty name and a conflict error if the id is taken.
    pub fn add(&mut self, persona: Persona) -> Result<PersonaId> {
        validate(&persona)?;
        if self.get(&persona.id).is_some() {
            return Err(Error::conflict(format!(
                "persona {} already exists",
                persona.id
            )));
        }
        let id = persona.id.clone();
        self.personas.push(persona);
        Ok(id)
    }

    /// Replaces the persona with the same id.
    pub fn update(&mut self, persona: Persona) -> Result<()> {
        validate(&persona)?;
        let slot = self
            .personas
            .iter_mut()
            .find(|p| p.id == persona.id)
            .ok_or_else(|| not_found(&persona.id))?;
        *slot = persona;
        Ok(())
    }

    /// Removes a persona. The default persona cannot be removed.
    pub fn remove(&mut self, id: &PersonaId) -> Result<Persona> {
        if *id == PersonaId::default_persona() {
            return Err(Error::validation(
                "the default persona cannot be removed",
                Some("persona".to_string()),
            ));
        }
        let index = self
            .personas
            .iter()
            .position(|p| &p.id == id)
            .ok_or_else(|| not_found(id))?;
        Ok(self.personas.remove(index))
    }

    /// Personas whose name or prompt contains `query`, ignoring case.
    ///
    /// Filters the list as it is now; an empty query matches everything.
    pub fn search(&self, query: &str) -> Vec<Persona> {
        let query = query.trim().to_lowercase();
        self.personas
            .iter()
            .filter(|p| {
                query.is_empty()
                    || p.name.to_lowercase().contains(&query)
                    || p.prompt.to_lowercase().contains(&query)
            })
            .cloned()
            .collect()
    }
}

impl Default for PersonaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(persona: &Persona) -> Result<()> {
    if persona.name.trim().is_empty() {
        return Err(Error::validation(
            "persona name must not be empty",
            Some("name".to_string()),
        ));
    }
    Ok(())
}

fn not_found(id: &PersonaId) -> Error {
    Error::not_found(
        "no such persona",
        Some("persona".to_string()),
        Some(id.to_string()),
    )
}

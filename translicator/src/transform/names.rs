//! Name tables for the deterministic fake-name transform. Small on
//! purpose: the goal is plausible redaction, not demographic realism.

pub const FIRST_NAMES: &[&str] = &[
    "Alex", "Amara", "Ben", "Bianca", "Casey", "Chen", "Dana", "Diego", "Elena", "Emil",
    "Farah", "Felix", "Grace", "Hana", "Hugo", "Ines", "Ivan", "Jada", "Jonas", "Kai",
    "Kira", "Leila", "Liam", "Maya", "Milan", "Nadia", "Noah", "Omar", "Priya", "Quinn",
    "Rosa", "Sam", "Sofia", "Tariq", "Tessa", "Uma", "Victor", "Wanda", "Yara", "Zane",
];

pub const LAST_NAMES: &[&str] = &[
    "Abbott", "Alvarez", "Becker", "Brennan", "Castillo", "Chandra", "Dunn", "Eriksen",
    "Fischer", "Fontaine", "Gallagher", "Haddad", "Ibarra", "Jansen", "Kapoor", "Keller",
    "Lindqvist", "Mori", "Ncube", "Novak", "Okafor", "Petrov", "Quintero", "Rahman",
    "Sato", "Silva", "Takacs", "Ueda", "Vargas", "Weber", "Xu", "Yilmaz", "Zhang",
];

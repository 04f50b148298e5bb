//! Seeded synthetic-data generator backing the `{{faker.*}}` placeholders.
//!
//! Data is generated from small per-locale word tables driven by a seeded
//! RNG. The seed mixes wall-clock nanoseconds, the VU id, the iteration, and
//! a random 16-bit salt so concurrent users diverge; configuring a fixed
//! seed drops the time and salt terms, making output reproducible per
//! (vu, iteration).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::plan::model::{FakerConfig, FakerLocale};

pub struct Faker {
    config: FakerConfig,
}

impl Faker {
    pub fn new(config: FakerConfig) -> Self {
        Self { config }
    }

    /// Generate a value for a dotted faker path such as `person.firstName`.
    /// Unknown paths return `None`; the caller leaves the token literal.
    pub fn generate(&self, path: &str, vu_id: u32, iteration: u64) -> Option<String> {
        let mut rng = StdRng::seed_from_u64(self.derive_seed(vu_id, iteration));
        let locale = locale_table(self.config.locale);

        let value = match path {
            // -- person --
            "person.firstName" => pick(&mut rng, locale.first_names).to_string(),
            "person.lastName" => pick(&mut rng, locale.last_names).to_string(),
            "person.fullName" => format!(
                "{} {}",
                pick(&mut rng, locale.first_names),
                pick(&mut rng, locale.last_names)
            ),
            "person.sex" => pick(&mut rng, &["female", "male"]).to_string(),

            // -- internet --
            "internet.email" => {
                let first = pick(&mut rng, locale.first_names).to_lowercase();
                let last = pick(&mut rng, locale.last_names).to_lowercase();
                let domain = pick(&mut rng, &["example.com", "test.org", "mail.net"]);
                format!("{first}.{last}{}@{domain}", rng.gen_range(1..100))
            }
            "internet.userName" => {
                let first = pick(&mut rng, locale.first_names).to_lowercase();
                format!("{first}{}", rng.gen_range(10..10_000))
            }
            "internet.password" => alphanumeric(&mut rng, 16),
            "internet.url" => {
                let word = pick(&mut rng, locale.words);
                format!("https://{word}.example.com")
            }
            "internet.ipv4" => format!(
                "{}.{}.{}.{}",
                rng.gen_range(1..255u8),
                rng.gen_range(0..255u8),
                rng.gen_range(0..255u8),
                rng.gen_range(1..255u8)
            ),

            // -- string --
            "string.uuid" => uuid_from(&mut rng),
            "string.alphanumeric" => alphanumeric(&mut rng, 10),
            "string.numeric" => (0..8)
                .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
                .collect(),

            // -- number --
            "number.int" => rng.gen_range(0..100_000i64).to_string(),
            "number.float" => format!("{:.2}", rng.gen_range(0.0..100_000.0f64)),

            // -- location --
            "location.streetAddress" => format!(
                "{} {}",
                rng.gen_range(1..9999u32),
                pick(&mut rng, locale.streets)
            ),
            "location.city" => pick(&mut rng, locale.cities).to_string(),
            "location.state" => pick(&mut rng, locale.states).to_string(),
            "location.country" => pick(&mut rng, locale.countries).to_string(),
            "location.zipCode" => format!("{:05}", rng.gen_range(1000..99999u32)),

            // -- commerce --
            "commerce.productName" => format!(
                "{} {}",
                pick(&mut rng, &["Ergonomic", "Rustic", "Sleek", "Compact", "Modular"]),
                pick(&mut rng, &["Chair", "Lamp", "Keyboard", "Bottle", "Backpack"])
            ),
            "commerce.price" => format!("{:.2}", rng.gen_range(1.0..1000.0f64)),
            "commerce.productDescription" => sentence(&mut rng, locale.words, 8),

            // -- date --
            "date.past" => offset_date(-(rng.gen_range(1..365i64))),
            "date.future" => offset_date(rng.gen_range(1..365i64)),
            "date.recent" => offset_date(-(rng.gen_range(0..7i64))),

            // -- company --
            "company.name" => format!(
                "{} {}",
                pick(&mut rng, locale.last_names),
                pick(&mut rng, &["GmbH", "Inc", "Ltd", "Group", "Labs"])
            ),
            "company.catchPhrase" => sentence(&mut rng, locale.words, 5),

            // -- lorem --
            "lorem.word" => pick(&mut rng, locale.words).to_string(),
            "lorem.sentence" => sentence(&mut rng, locale.words, 8),
            "lorem.paragraph" => {
                let sentences: Vec<String> =
                    (0..4).map(|_| sentence(&mut rng, locale.words, 8)).collect();
                sentences.join(" ")
            }

            // -- phone --
            "phone.number" => format!(
                "+{} {} {}",
                rng.gen_range(1..99u8),
                rng.gen_range(100..999u32),
                rng.gen_range(1_000_000..9_999_999u32)
            ),

            _ => return None,
        };
        Some(value)
    }

    fn derive_seed(&self, vu_id: u32, iteration: u64) -> u64 {
        let vu_term = vu_id as u64 * 100_000;
        let iter_term = iteration * 1_000;
        match self.config.seed {
            Some(seed) => seed ^ vu_term ^ iter_term,
            None => {
                let now_ns = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0);
                let salt: u16 = rand::thread_rng().gen();
                now_ns ^ vu_term ^ iter_term ^ salt as u64
            }
        }
    }
}

fn pick<'a, T: ?Sized>(rng: &mut StdRng, items: &'a [&'a T]) -> &'a T {
    items[rng.gen_range(0..items.len())]
}

fn alphanumeric(rng: &mut StdRng, len: usize) -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    (0..len)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

fn uuid_from(rng: &mut StdRng) -> String {
    let bytes: [u8; 16] = rng.gen();
    uuid::Builder::from_random_bytes(bytes)
        .into_uuid()
        .to_string()
}

fn sentence(rng: &mut StdRng, words: &[&str], len: usize) -> String {
    let mut parts: Vec<&str> = (0..len).map(|_| pick(rng, words)).collect();
    let first = parts[0].to_string();
    let mut capitalized = first.chars();
    let head = capitalized
        .next()
        .map(|c| c.to_uppercase().collect::<String>() + capitalized.as_str())
        .unwrap_or_default();
    let rest = parts.split_off(1).join(" ");
    if rest.is_empty() {
        format!("{head}.")
    } else {
        format!("{head} {rest}.")
    }
}

fn offset_date(days: i64) -> String {
    (chrono::Utc::now() + chrono::Duration::days(days))
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
}

// ---------------------------------------------------------------------------
// Locale tables
// ---------------------------------------------------------------------------

struct LocaleTable {
    first_names: &'static [&'static str],
    last_names: &'static [&'static str],
    cities: &'static [&'static str],
    states: &'static [&'static str],
    countries: &'static [&'static str],
    streets: &'static [&'static str],
    words: &'static [&'static str],
}

const EN: LocaleTable = LocaleTable {
    first_names: &[
        "James", "Mary", "Robert", "Patricia", "John", "Jennifer", "Michael", "Linda", "David",
        "Elizabeth", "William", "Susan",
    ],
    last_names: &[
        "Smith", "Johnson", "Williams", "Brown", "Jones", "Garcia", "Miller", "Davis", "Wilson",
        "Anderson", "Taylor", "Moore",
    ],
    cities: &[
        "Springfield", "Riverton", "Fairview", "Georgetown", "Arlington", "Clinton", "Salem",
        "Madison", "Oakland", "Bristol",
    ],
    states: &[
        "California", "Texas", "Florida", "New York", "Ohio", "Georgia", "Oregon", "Colorado",
    ],
    countries: &["United States", "Canada", "United Kingdom", "Australia", "Ireland"],
    streets: &["Main Street", "Oak Avenue", "Park Road", "Maple Drive", "Cedar Lane", "Elm Street"],
    words: &[
        "system", "value", "process", "window", "signal", "order", "metal", "garden", "river",
        "stone", "light", "paper", "engine", "market", "silver",
    ],
};

const DE: LocaleTable = LocaleTable {
    first_names: &[
        "Lukas", "Anna", "Leon", "Lena", "Finn", "Emma", "Jonas", "Mia", "Paul", "Laura",
    ],
    last_names: &[
        "Müller", "Schmidt", "Schneider", "Fischer", "Weber", "Meyer", "Wagner", "Becker",
    ],
    cities: &["Berlin", "Hamburg", "München", "Köln", "Frankfurt", "Stuttgart", "Leipzig"],
    states: &["Bayern", "Hessen", "Sachsen", "Berlin", "Hamburg", "Bremen"],
    countries: &["Deutschland", "Österreich", "Schweiz"],
    streets: &["Hauptstraße", "Bahnhofstraße", "Gartenweg", "Schulstraße", "Lindenallee"],
    words: &[
        "haus", "wasser", "stadt", "wald", "licht", "zeit", "weg", "berg", "feld", "stein",
    ],
};

const FR: LocaleTable = LocaleTable {
    first_names: &[
        "Lucas", "Emma", "Louis", "Chloé", "Hugo", "Léa", "Arthur", "Manon", "Jules", "Camille",
    ],
    last_names: &[
        "Martin", "Bernard", "Dubois", "Thomas", "Robert", "Richard", "Petit", "Durand",
    ],
    cities: &["Paris", "Lyon", "Marseille", "Toulouse", "Nantes", "Bordeaux", "Lille"],
    states: &["Bretagne", "Normandie", "Occitanie", "Grand Est", "Île-de-France"],
    countries: &["France", "Belgique", "Suisse", "Canada"],
    streets: &["Rue de la Paix", "Avenue Victor Hugo", "Boulevard Saint-Michel", "Rue des Lilas"],
    words: &[
        "maison", "ville", "temps", "monde", "fleur", "pierre", "chemin", "forêt", "mer", "pont",
    ],
};

const ES: LocaleTable = LocaleTable {
    first_names: &[
        "Hugo", "Lucía", "Martín", "Sofía", "Daniel", "María", "Pablo", "Paula", "Diego", "Carla",
    ],
    last_names: &[
        "García", "Rodríguez", "González", "Fernández", "López", "Martínez", "Sánchez", "Pérez",
    ],
    cities: &["Madrid", "Barcelona", "Valencia", "Sevilla", "Zaragoza", "Málaga", "Bilbao"],
    states: &["Andalucía", "Cataluña", "Galicia", "Aragón", "Castilla y León"],
    countries: &["España", "México", "Argentina", "Chile", "Colombia"],
    streets: &["Calle Mayor", "Avenida de la Constitución", "Paseo del Prado", "Calle Real"],
    words: &[
        "casa", "tiempo", "ciudad", "campo", "piedra", "camino", "bosque", "luz", "agua", "puente",
    ],
};

const NL: LocaleTable = LocaleTable {
    first_names: &[
        "Daan", "Emma", "Sem", "Julia", "Lucas", "Mila", "Finn", "Tess", "Levi", "Sara",
    ],
    last_names: &[
        "de Jong", "Jansen", "de Vries", "van den Berg", "Bakker", "Visser", "Smit", "Meijer",
    ],
    cities: &["Amsterdam", "Rotterdam", "Utrecht", "Den Haag", "Eindhoven", "Groningen"],
    states: &["Noord-Holland", "Zuid-Holland", "Utrecht", "Gelderland", "Brabant"],
    countries: &["Nederland", "België", "Luxemburg"],
    streets: &["Hoofdstraat", "Kerkstraat", "Dorpsstraat", "Molenweg", "Stationsweg"],
    words: &[
        "huis", "water", "stad", "bos", "licht", "tijd", "weg", "berg", "veld", "steen",
    ],
};

fn locale_table(locale: FakerLocale) -> &'static LocaleTable {
    match locale {
        FakerLocale::En => &EN,
        FakerLocale::De => &DE,
        FakerLocale::Fr => &FR,
        FakerLocale::Es => &ES,
        FakerLocale::Nl => &NL,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Faker {
        Faker::new(FakerConfig {
            locale: FakerLocale::En,
            seed: Some(42),
        })
    }

    #[test]
    fn all_documented_paths_generate() {
        let faker = seeded();
        let paths = [
            "person.firstName",
            "person.lastName",
            "person.fullName",
            "person.sex",
            "internet.email",
            "internet.userName",
            "internet.password",
            "internet.url",
            "internet.ipv4",
            "string.uuid",
            "string.alphanumeric",
            "string.numeric",
            "number.int",
            "number.float",
            "location.streetAddress",
            "location.city",
            "location.state",
            "location.country",
            "location.zipCode",
            "commerce.productName",
            "commerce.price",
            "commerce.productDescription",
            "date.past",
            "date.future",
            "date.recent",
            "company.name",
            "company.catchPhrase",
            "lorem.word",
            "lorem.sentence",
            "lorem.paragraph",
            "phone.number",
        ];
        for path in paths {
            let value = faker.generate(path, 1, 0);
            assert!(value.is_some(), "path {path} must generate");
            assert!(!value.unwrap().is_empty(), "path {path} must be non-empty");
        }
    }

    #[test]
    fn unknown_path_returns_none() {
        let faker = seeded();
        assert!(faker.generate("animal.cat", 1, 0).is_none());
        assert!(faker.generate("person.middleName", 1, 0).is_none());
    }

    #[test]
    fn fixed_seed_is_reproducible() {
        let a = seeded().generate("person.fullName", 3, 2).unwrap();
        let b = seeded().generate("person.fullName", 3, 2).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fixed_seed_varies_across_vus_and_iterations() {
        let faker = seeded();
        let base = faker.generate("string.alphanumeric", 1, 0).unwrap();
        let other_vu = faker.generate("string.alphanumeric", 2, 0).unwrap();
        let other_iter = faker.generate("string.alphanumeric", 1, 1).unwrap();
        // Different seed inputs almost surely diverge for a 10-char string.
        assert_ne!(base, other_vu);
        assert_ne!(base, other_iter);
    }

    #[test]
    fn email_has_address_shape() {
        let email = seeded().generate("internet.email", 1, 0).unwrap();
        assert!(email.contains('@'), "got {email}");
        assert!(email.contains('.'));
    }

    #[test]
    fn ipv4_has_four_octets() {
        let ip = seeded().generate("internet.ipv4", 1, 0).unwrap();
        let octets: Vec<&str> = ip.split('.').collect();
        assert_eq!(octets.len(), 4);
        for octet in octets {
            assert!(octet.parse::<u16>().unwrap() < 256);
        }
    }

    #[test]
    fn uuid_is_parseable() {
        let value = seeded().generate("string.uuid", 1, 0).unwrap();
        assert!(uuid::Uuid::parse_str(&value).is_ok());
    }

    #[test]
    fn locales_localize_names() {
        let de = Faker::new(FakerConfig {
            locale: FakerLocale::De,
            seed: Some(7),
        });
        let city = de.generate("location.city", 1, 0).unwrap();
        assert!(DE.cities.contains(&city.as_str()));
    }

    #[test]
    fn date_past_is_before_future() {
        let faker = seeded();
        let past = faker.generate("date.past", 1, 0).unwrap();
        let future = faker.generate("date.future", 1, 0).unwrap();
        assert!(past < future, "{past} should sort before {future}");
    }
}

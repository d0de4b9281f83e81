/*!
Devkit Weft

Outillage de développement et de test pour le kernel et les simulateurs :
- MockTransport : broker et devices simulés, sans réseau
- fixtures : catalog YAML prêt à l'emploi (devices, grammaire, templates)
- builders : messages de télémétrie et de statut conformes aux contrats
*/

pub mod fixtures;
pub mod mqtt_stub;

pub use fixtures::{status_message, telemetry_message, write_catalog_fixtures, CatalogFixture};
pub use mqtt_stub::{MockMessage, MockTransport};

use crate::{
    agent::{image::Image, machine::machine::MachineDescriptor},
    machinery::store::Record,
};

impl Record for Image {
    const COLLECTION: &'static str = "image";

    fn record_name(&self) -> &str {
        &self.name
    }
}

impl Record for MachineDescriptor {
    const COLLECTION: &'static str = "machine";

    fn record_name(&self) -> &str {
        &self.name
    }
}

mod camera_view;
mod device_view;
mod painter;
mod spinner;
mod table;

pub(crate) use self::camera_view::{CameraListView, InspectView};
pub(crate) use self::device_view::{
    FirmwareNoticesView, PairedDevicesView, StateChangeView, SummaryView,
};
pub(crate) use self::painter::Painter;
pub(crate) use self::spinner::Spinner;

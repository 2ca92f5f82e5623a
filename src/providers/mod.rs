//! External collaborators consumed through narrow interfaces: the route/stop
//! directory and the scheduled timetable it carries.

pub mod directory;
